//! AccumulatorStage: groups readouts into reconstruction jobs.
//!
//! Readouts are buffered until `profiles_per_frame × frames_per_reconstruction`
//! have arrived. The buffer is then concatenated in arrival order, coil maps
//! are estimated and one `Job` message is emitted. Messages that are not
//! readouts pass straight through.

use crate::array::{CArray, RArray};
use crate::error::{ReconError, Result};
use crate::job::ReconJob;
use crate::operators::{CsmProvider, RssCsmEstimator, UniformCsm};
use crate::pipeline::message::{IndexCounters, Message, MessageKind, Payload};
use crate::pipeline::stage::{ConfigureContext, Emitter, Stage};
use ndarray::{concatenate, Axis, IxDyn};

struct Profile {
    counters: IndexCounters,
    samples: CArray,
    trajectory: RArray,
    dcw: Option<RArray>,
}

pub struct AccumulatorStage {
    profiles_per_frame: usize,
    frames: usize,
    matrix_size: usize,
    emit_partial_on_drain: bool,
    csm: Box<dyn CsmProvider>,
    buffer: Vec<Profile>,
    jobs_emitted: u32,
}

impl AccumulatorStage {
    pub fn new() -> Self {
        Self {
            profiles_per_frame: 1,
            frames: 1,
            matrix_size: 0,
            emit_partial_on_drain: false,
            csm: Box::new(UniformCsm),
            buffer: Vec::new(),
            jobs_emitted: 0,
        }
    }

    /// Use `provider` for coil maps unless the options name one.
    pub fn with_csm_provider(mut self, provider: Box<dyn CsmProvider>) -> Self {
        self.csm = provider;
        self
    }

    /// Readouts per job.
    pub fn quota(&self) -> usize {
        self.profiles_per_frame * self.frames
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn jobs_emitted(&self) -> u32 {
        self.jobs_emitted
    }

    pub fn csm_provider(&self) -> &str {
        self.csm.name()
    }

    fn unpack(message: Message) -> Result<Profile> {
        let counters = message.header().counters;
        let (_, payloads) = message.into_parts();
        let mut payloads = payloads.into_iter();

        let samples = match payloads.next() {
            Some(Payload::Complex(s)) if s.ndim() == 2 => s,
            _ => return Err(ReconError::data("readout samples must be [samples, channels]")),
        };
        let n = samples.shape()[0];
        let trajectory = match payloads.next() {
            Some(Payload::Real(t)) if t.shape() == [n, 2] => t,
            _ => {
                return Err(ReconError::data(format!(
                    "readout {} has no [{}, 2] trajectory",
                    counters.profile, n
                )))
            }
        };
        let dcw = match payloads.next() {
            None => None,
            Some(Payload::Real(d)) if d.shape() == [n] => Some(d),
            Some(_) => {
                return Err(ReconError::data(format!(
                    "readout {} has malformed density weights",
                    counters.profile
                )))
            }
        };
        Ok(Profile {
            counters,
            samples,
            trajectory,
            dcw,
        })
    }

    fn check_consistent(&self, profile: &Profile) -> Result<()> {
        if let Some(first) = self.buffer.first() {
            if first.samples.shape() != profile.samples.shape() {
                return Err(ReconError::data(format!(
                    "readout {} is {:?}, buffered readouts are {:?}",
                    profile.counters.profile,
                    profile.samples.shape(),
                    first.samples.shape()
                )));
            }
        }
        Ok(())
    }

    /// Build and emit a job from the first `frames` whole frames in the buffer.
    fn emit_job(&mut self, frames: usize, out: &mut Emitter) -> Result<()> {
        let count = frames * self.profiles_per_frame;
        let profiles: Vec<Profile> = self.buffer.drain(..count).collect();
        let counters = IndexCounters {
            frame: 0,
            image_index: self.jobs_emitted,
            ..profiles[0].counters
        };

        let samples = concatenate(
            Axis(0),
            &profiles.iter().map(|p| p.samples.view()).collect::<Vec<_>>(),
        )
        .map_err(|e| ReconError::data(format!("cannot concatenate samples: {}", e)))?;
        let trajectory = concatenate(
            Axis(0),
            &profiles.iter().map(|p| p.trajectory.view()).collect::<Vec<_>>(),
        )
        .map_err(|e| ReconError::data(format!("cannot concatenate trajectory: {}", e)))?;
        let dcw_parts: Vec<RArray> = profiles
            .iter()
            .map(|p| {
                p.dcw
                    .clone()
                    .unwrap_or_else(|| RArray::ones(IxDyn(&[p.samples.shape()[0]])))
            })
            .collect();
        let dcw = concatenate(
            Axis(0),
            &dcw_parts.iter().map(|d| d.view()).collect::<Vec<_>>(),
        )
        .map_err(|e| ReconError::data(format!("cannot concatenate density weights: {}", e)))?;
        drop(profiles);

        let csm = self
            .csm
            .estimate(&samples, &trajectory, &dcw, self.matrix_size, frames)?;
        let job = ReconJob::new(samples, trajectory, dcw, csm, frames);
        job.validate()?;

        tracing::debug!(
            "Accumulator: job {} with {} samples, {} frames, {} channels",
            self.jobs_emitted,
            job.sample_count(),
            frames,
            job.channels()
        );
        self.jobs_emitted += 1;
        out.emit(Message::job(counters, job))
    }
}

impl Default for AccumulatorStage {
    fn default() -> Self {
        Self::new()
    }
}

fn positive(ctx: &ConfigureContext, key: &str, value: i64) -> Result<usize> {
    Ok(ctx.clamp.at_least(key, value, 1)? as usize)
}

impl Stage for AccumulatorStage {
    fn name(&self) -> &str {
        "accumulator"
    }

    fn configure(&mut self, ctx: &ConfigureContext) -> Result<()> {
        let options = ctx.options;
        self.profiles_per_frame =
            positive(ctx, "profiles_per_frame", options.require_int("profiles_per_frame")?)?;
        self.frames = positive(
            ctx,
            "frames_per_reconstruction",
            options.int_or("frames_per_reconstruction", 1)?,
        )?;
        self.matrix_size = positive(ctx, "matrix_size", options.require_int("matrix_size")?)?;
        self.emit_partial_on_drain = options.bool_or("emit_partial_on_drain", false)?;

        if let Some(name) = options.string("csm")? {
            self.csm = match name.as_str() {
                "uniform" => Box::new(UniformCsm),
                "rss" => Box::new(RssCsmEstimator::default()),
                other => {
                    return Err(ReconError::config(format!(
                        "unknown csm provider '{}' (expected uniform or rss)",
                        other
                    )))
                }
            };
        }

        tracing::info!(
            "Accumulator: {} profiles x {} frames per job, matrix {}, csm {}",
            self.profiles_per_frame,
            self.frames,
            self.matrix_size,
            self.csm.name()
        );
        Ok(())
    }

    fn process(&mut self, message: Message, out: &mut Emitter) -> Result<()> {
        if message.kind() != MessageKind::Acquisition {
            return out.emit(message);
        }
        if message.is_noise() {
            out.absorb(message);
            return Ok(());
        }

        let profile = Self::unpack(message)?;
        self.check_consistent(&profile)?;
        self.buffer.push(profile);

        if self.buffer.len() >= self.quota() {
            self.emit_job(self.frames, out)?;
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut Emitter) -> Result<()> {
        let whole_frames = self.buffer.len() / self.profiles_per_frame;
        if self.emit_partial_on_drain && whole_frames > 0 {
            tracing::info!(
                "Accumulator: emitting partial job with {} of {} frames",
                whole_frames,
                self.frames
            );
            self.emit_job(whole_frames, out)?;
        }
        if !self.buffer.is_empty() {
            tracing::info!(
                "Accumulator: discarding {} readouts short of a job at end of stream",
                self.buffer.len()
            );
            out.absorb_buffered(self.buffer.len());
            self.buffer.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{self, Complex64};
    use crate::config::StageOptions;
    use crate::device::DeviceRegistry;
    use crate::pipeline::queue::BoundedQueue;

    const N: usize = 4;

    fn stage(options: StageOptions) -> Result<AccumulatorStage> {
        let devices = DeviceRegistry::new(1);
        let ctx = ConfigureContext::new("accumulator", &options, &devices);
        let mut stage = AccumulatorStage::new();
        stage.configure(&ctx)?;
        Ok(stage)
    }

    fn options(profiles: i64, frames: i64) -> StageOptions {
        StageOptions::new()
            .with("profiles_per_frame", profiles)
            .with("frames_per_reconstruction", frames)
            .with("matrix_size", N as i64)
    }

    fn readout(profile: u32) -> Message {
        let mut samples = array::create(&[N, 2]);
        samples.fill(Complex64::new(profile as f64 + 1.0, 0.0));
        let mut trajectory = array::create_real(&[N, 2]);
        for s in 0..N {
            trajectory[[s, 0]] = (s as f64 - 2.0) / N as f64;
            trajectory[[s, 1]] = (profile as f64 % N as f64 - 2.0) / N as f64;
        }
        let counters = IndexCounters {
            profile,
            ..Default::default()
        };
        Message::acquisition(counters, samples, trajectory, None)
    }

    fn feed(stage: &mut AccumulatorStage, n: u32, out: &mut Emitter) {
        for p in 0..n {
            stage.process(readout(p), out).unwrap();
        }
    }

    #[test]
    fn test_emits_floor_n_over_quota_jobs() {
        let mut acc = stage(options(2, 2)).unwrap();
        assert_eq!(acc.quota(), 4);
        let next = BoundedQueue::new(16);
        let mut out = Emitter::new(next.clone());

        feed(&mut acc, 11, &mut out);
        assert_eq!(next.len(), 2);
        assert_eq!(acc.buffered(), 3);

        let first = next.pop().unwrap();
        let job = first.job_ref().unwrap();
        assert_eq!(job.frames, 2);
        assert_eq!(job.sample_count(), 4 * N);
        assert_eq!(job.csm.shape(), &[N, N, 2]);
        assert_eq!(job.dcw.len(), 4 * N);
        // arrival order is preserved
        assert_eq!(job.samples[[0, 0]], Complex64::new(1.0, 0.0));
        assert_eq!(job.samples[[3 * N, 0]], Complex64::new(4.0, 0.0));

        let second = next.pop().unwrap();
        assert_eq!(second.header().counters.image_index, 1);
        assert_eq!(second.header().counters.profile, 4);
    }

    #[test]
    fn test_remainder_discarded_on_drain() {
        let mut acc = stage(options(2, 2)).unwrap();
        let next = BoundedQueue::new(16);
        let mut out = Emitter::new(next.clone());
        feed(&mut acc, 3, &mut out);
        acc.drain(&mut out).unwrap();
        assert!(next.is_empty());
        assert_eq!(acc.buffered(), 0);
        assert_eq!(out.stats().absorbed, 3);
        assert_eq!(out.stats().emitted, 0);
    }

    #[test]
    fn test_partial_job_on_drain() {
        let mut acc = stage(options(2, 3).with("emit_partial_on_drain", true)).unwrap();
        let next = BoundedQueue::new(16);
        let mut out = Emitter::new(next.clone());
        feed(&mut acc, 5, &mut out);
        acc.drain(&mut out).unwrap();

        let msg = next.pop().unwrap();
        assert_eq!(msg.job_ref().unwrap().frames, 2);
        assert!(next.is_empty());
        assert_eq!(acc.buffered(), 0);
        // the fifth readout is short of a whole frame
        assert_eq!(out.stats().absorbed, 1);
    }

    #[test]
    fn test_non_readouts_pass_through() {
        let mut acc = stage(options(2, 1)).unwrap();
        let next = BoundedQueue::new(4);
        let mut out = Emitter::new(next.clone());
        acc.process(
            Message::image(IndexCounters::default(), array::create(&[N, N])),
            &mut out,
        )
        .unwrap();
        acc.process(Message::noise(array::create(&[8, 2]), 1.0), &mut out)
            .unwrap();
        assert_eq!(next.pop().unwrap().kind(), MessageKind::Image);
        assert_eq!(out.stats().absorbed, 1);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_inconsistent_readout_is_data_error() {
        let mut acc = stage(options(4, 1)).unwrap();
        let mut out = Emitter::new(BoundedQueue::new(4));
        acc.process(readout(0), &mut out).unwrap();

        let short = Message::acquisition(
            IndexCounters::default(),
            array::create(&[2, 2]),
            array::create_real(&[2, 2]),
            None,
        );
        assert!(acc.process(short, &mut out).unwrap_err().is_recoverable());

        let no_trajectory = Message::acquisition(
            IndexCounters::default(),
            array::create(&[N, 2]),
            array::create_real(&[N, 3]),
            None,
        );
        assert!(acc.process(no_trajectory, &mut out).unwrap_err().is_recoverable());
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_configuration_errors() {
        let missing = StageOptions::new().with("profiles_per_frame", 4);
        assert!(matches!(stage(missing), Err(ReconError::Configuration(_))));

        assert!(stage(options(0, 1)).is_err());

        let bad_csm = options(2, 1).with("csm", "espirit");
        assert!(stage(bad_csm).is_err());

        let rss = stage(options(2, 1).with("csm", "rss")).unwrap();
        assert_eq!(rss.csm_provider(), "rss");
    }
}
