//! Messages passed between stages.
//!
//! A `Message` is a fixed-size header plus an ordered chain of owned payloads.
//! Pushing a message onto a queue moves the whole chain; whoever holds it last
//! without forwarding it drops it. [`Message::release`] makes that explicit and
//! shows up in traces.

use crate::array::{CArray, RArray};
use crate::job::ReconJob;
use serde::Serialize;
use std::fmt;

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// One readout: samples `[n, channels]`, trajectory `[n, 2]`, optional dcw `[n]`
    Acquisition,
    /// A complete reconstruction job
    Job,
    /// One reconstructed frame `[nx, ny]`
    Image,
}

/// Header bit flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(pub u64);

impl MessageFlags {
    pub const NOISE_MEASUREMENT: MessageFlags = MessageFlags(1 << 0);
    pub const PREWHITENED: MessageFlags = MessageFlags(1 << 1);
    pub const NOT_CONVERGED: MessageFlags = MessageFlags(1 << 2);
    pub const LAST_IN_SERIES: MessageFlags = MessageFlags(1 << 3);

    #[inline]
    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: MessageFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageFlags({:#x})", self.0)
    }
}

/// Position of the data within the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexCounters {
    pub scan: u32,
    pub profile: u32,
    pub frame: u32,
    pub slice: u16,
    pub repetition: u16,
    pub image_index: u32,
    pub image_series: u32,
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    /// Extents of the primary payload, unused trailing entries are 0
    pub extents: [usize; 4],
    pub channels: u16,
    pub counters: IndexCounters,
    pub flags: MessageFlags,
    /// Sampling dwell time in microseconds
    pub dwell_time_us: f32,
}

impl MessageHeader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            extents: [0; 4],
            channels: 0,
            counters: IndexCounters::default(),
            flags: MessageFlags::default(),
            dwell_time_us: 0.0,
        }
    }

    fn with_extents(mut self, shape: &[usize]) -> Self {
        self.extents = [0; 4];
        for (slot, &n) in self.extents.iter_mut().zip(shape) {
            *slot = n;
        }
        self
    }
}

/// One owned buffer in the payload chain.
#[derive(Debug, Clone)]
pub enum Payload {
    Complex(CArray),
    Real(RArray),
    Job(Box<ReconJob>),
}

impl Payload {
    pub fn as_complex(&self) -> Option<&CArray> {
        match self {
            Payload::Complex(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<&RArray> {
        match self {
            Payload::Real(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&ReconJob> {
        match self {
            Payload::Job(j) => Some(j),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    header: MessageHeader,
    payloads: Vec<Payload>,
}

impl Message {
    pub fn new(header: MessageHeader, payloads: Vec<Payload>) -> Self {
        Self { header, payloads }
    }

    /// An imaging readout.
    pub fn acquisition(
        counters: IndexCounters,
        samples: CArray,
        trajectory: RArray,
        dcw: Option<RArray>,
    ) -> Self {
        let mut header = MessageHeader::new(MessageKind::Acquisition).with_extents(samples.shape());
        header.counters = counters;
        header.channels = samples.shape().get(1).copied().unwrap_or(0) as u16;

        let mut payloads = vec![Payload::Complex(samples), Payload::Real(trajectory)];
        if let Some(dcw) = dcw {
            payloads.push(Payload::Real(dcw));
        }
        Self { header, payloads }
    }

    /// A noise-only readout `[n, channels]`, no trajectory.
    pub fn noise(samples: CArray, dwell_time_us: f32) -> Self {
        let mut header = MessageHeader::new(MessageKind::Acquisition).with_extents(samples.shape());
        header.channels = samples.shape().get(1).copied().unwrap_or(0) as u16;
        header.flags.insert(MessageFlags::NOISE_MEASUREMENT);
        header.dwell_time_us = dwell_time_us;
        Self {
            header,
            payloads: vec![Payload::Complex(samples)],
        }
    }

    pub fn job(counters: IndexCounters, job: ReconJob) -> Self {
        let mut header = MessageHeader::new(MessageKind::Job)
            .with_extents(&[job.matrix_size, job.matrix_size, job.frames]);
        header.counters = counters;
        header.channels = job.channels() as u16;
        Self {
            header,
            payloads: vec![Payload::Job(Box::new(job))],
        }
    }

    pub fn image(counters: IndexCounters, image: CArray) -> Self {
        let mut header = MessageHeader::new(MessageKind::Image).with_extents(image.shape());
        header.counters = counters;
        header.channels = 1;
        Self {
            header,
            payloads: vec![Payload::Complex(image)],
        }
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    #[inline]
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    #[inline]
    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    pub fn is_noise(&self) -> bool {
        self.header.flags.contains(MessageFlags::NOISE_MEASUREMENT)
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// Primary complex payload: acquisition samples or image pixels.
    pub fn samples(&self) -> Option<&CArray> {
        self.payloads.first().and_then(Payload::as_complex)
    }

    pub fn samples_mut(&mut self) -> Option<&mut CArray> {
        match self.payloads.first_mut() {
            Some(Payload::Complex(a)) => Some(a),
            _ => None,
        }
    }

    pub fn trajectory(&self) -> Option<&RArray> {
        self.payloads.get(1).and_then(Payload::as_real)
    }

    pub fn dcw(&self) -> Option<&RArray> {
        self.payloads.get(2).and_then(Payload::as_real)
    }

    pub fn job_ref(&self) -> Option<&ReconJob> {
        self.payloads.first().and_then(Payload::as_job)
    }

    /// Take ownership of the header and payload chain.
    pub fn into_parts(self) -> (MessageHeader, Vec<Payload>) {
        (self.header, self.payloads)
    }

    /// Detach the job from a job message.
    pub fn into_job(self) -> Option<(MessageHeader, Box<ReconJob>)> {
        let (header, payloads) = self.into_parts();
        payloads.into_iter().find_map(|p| match p {
            Payload::Job(job) => Some((header, job)),
            _ => None,
        })
    }

    /// Drop the message and everything chained to it.
    pub fn release(self) {
        tracing::trace!(
            "Releasing {:?} message ({} payloads, profile {})",
            self.header.kind,
            self.payloads.len(),
            self.header.counters.profile
        );
    }
}
