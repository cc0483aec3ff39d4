//! Plugin stages and channel helpers

use crossbeam_channel::Receiver;
use recon_rs::error::{ReconError, Result};
use recon_rs::pipeline::{ConfigureContext, Emitter, Message, QueueEvent, Stage};

/// Forwards every message unchanged.
pub struct Passthrough;

impl Stage for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn configure(&mut self, _ctx: &ConfigureContext) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        out.emit(message)
    }
}

/// Fails fatally on the n-th message it receives.
pub struct FailOnNth {
    pub n: u64,
    seen: u64,
}

impl FailOnNth {
    pub fn new(n: u64) -> Self {
        Self { n, seen: 0 }
    }
}

impl Stage for FailOnNth {
    fn name(&self) -> &str {
        "fail_on_nth"
    }

    fn configure(&mut self, _ctx: &ConfigureContext) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        self.seen += 1;
        if self.seen == self.n {
            message.release();
            return Err(ReconError::Resource("device lost".into()));
        }
        out.emit(message)
    }
}

/// Everything recorded on an event channel so far.
pub fn drain_events(rx: &Receiver<QueueEvent>) -> Vec<QueueEvent> {
    rx.try_iter().collect()
}
