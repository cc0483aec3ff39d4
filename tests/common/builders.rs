//! Test data builders for configs and phantom scans

use recon_rs::config::{PipelineSettings, ReconConfig, StageConfig, StageOptions};
use recon_rs::phantom::{Phantom, PhantomSpec};
use recon_rs::pipeline::StageKind;

/// Builder for a noise adjust → accumulator → solver chain
pub struct ChainBuilder {
    matrix_size: usize,
    profiles_per_frame: usize,
    frames: usize,
    queue_capacity: usize,
    noise_adjust: bool,
    csm: &'static str,
    solver: StageKind,
    solver_options: StageOptions,
}

impl ChainBuilder {
    pub fn new(matrix_size: usize) -> Self {
        Self {
            matrix_size,
            profiles_per_frame: matrix_size,
            frames: 1,
            queue_capacity: 8,
            noise_adjust: true,
            csm: "rss",
            solver: StageKind::CgSense,
            solver_options: StageOptions::new(),
        }
    }

    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn profiles_per_frame(mut self, profiles: usize) -> Self {
        self.profiles_per_frame = profiles;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn without_noise_adjust(mut self) -> Self {
        self.noise_adjust = false;
        self
    }

    pub fn csm(mut self, provider: &'static str) -> Self {
        self.csm = provider;
        self
    }

    pub fn solver(mut self, kind: StageKind, options: StageOptions) -> Self {
        self.solver = kind;
        self.solver_options = options;
        self
    }

    pub fn build(self) -> ReconConfig {
        let mut stages = Vec::new();
        if self.noise_adjust {
            stages.push(StageConfig::new(StageKind::NoiseAdjust));
        }
        stages.push(
            StageConfig::new(StageKind::Accumulator).with_options(
                StageOptions::new()
                    .with("profiles_per_frame", self.profiles_per_frame as i64)
                    .with("frames_per_reconstruction", self.frames as i64)
                    .with("matrix_size", self.matrix_size as i64)
                    .with("csm", self.csm),
            ),
        );
        stages.push(StageConfig::new(self.solver).with_options(self.solver_options));

        ReconConfig {
            pipeline: PipelineSettings {
                queue_capacity: self.queue_capacity,
                device_count: Some(1),
                ..Default::default()
            },
            stages,
            ..Default::default()
        }
    }
}

/// Phantom matching a chain built with the same parameters.
pub fn phantom(matrix_size: usize, coils: usize, frames: usize) -> Phantom {
    Phantom::new(PhantomSpec {
        matrix_size,
        coils,
        frames,
        profiles_per_frame: matrix_size,
        ..Default::default()
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builder() {
        let config = ChainBuilder::new(8).without_noise_adjust().build();
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].kind, StageKind::Accumulator);
        assert!(config.validate().is_ok());
    }
}
