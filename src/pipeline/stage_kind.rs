//! Stage kind enumeration for config-driven stage creation.

use serde::{Deserialize, Serialize};

/// Types of stages that can be instantiated from a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Noise covariance estimation and prewhitening.
    NoiseAdjust,
    /// Groups readouts into reconstruction jobs.
    Accumulator,
    /// Conjugate-gradient SENSE reconstruction.
    CgSense,
    /// Gradient-projection SENSE reconstruction with TV / TV-PICS.
    GpSense,
}

impl StageKind {
    /// Key used in config files and as the default stage name.
    pub fn config_key(&self) -> &'static str {
        match self {
            StageKind::NoiseAdjust => "noise_adjust",
            StageKind::Accumulator => "accumulator",
            StageKind::CgSense => "cg_sense",
            StageKind::GpSense => "gp_sense",
        }
    }

    /// Get the display name for this stage kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::NoiseAdjust => "Noise Adjust",
            StageKind::Accumulator => "Accumulator",
            StageKind::CgSense => "CG-SENSE",
            StageKind::GpSense => "GP-SENSE",
        }
    }

    /// Get all available stage kinds.
    pub fn all() -> &'static [StageKind] {
        &[
            StageKind::NoiseAdjust,
            StageKind::Accumulator,
            StageKind::CgSense,
            StageKind::GpSense,
        ]
    }

    /// Whether this stage runs an iterative solver.
    pub fn is_solver(&self) -> bool {
        matches!(self, StageKind::CgSense | StageKind::GpSense)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageKind::NoiseAdjust =>
                "Estimates the receiver noise covariance from noise readouts.\n\
                 Whitens later readouts with the inverse Cholesky factor.\n\
                 Passes data through untouched until noise has been seen.",

            StageKind::Accumulator =>
                "Buffers readouts until profiles_per_frame x frames are present.\n\
                 Estimates coil maps and emits one reconstruction job.\n\
                 Non-readout messages pass straight through.",

            StageKind::CgSense =>
                "Solves the regularised SENSE normal equations with CG.\n\
                 Identity or image-weight regularizer, Jacobi preconditioner.\n\
                 Emits one image per frame.",

            StageKind::GpSense =>
                "Minimises the SENSE cost with TV and TV-PICS penalties.\n\
                 Barzilai-Borwein steps with backtracking.\n\
                 Starts from the frame-averaged prior image.",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
