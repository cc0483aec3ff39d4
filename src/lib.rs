//! # recon-rs: streaming iterative MRI reconstruction
//!
//! Raw multi-coil readouts stream through a chain of stages joined by
//! bounded queues. Stages prewhiten against a noise measurement, accumulate
//! readouts into reconstruction jobs, and solve each job with an iterative
//! SENSE solver.
//!
//! ## Architecture
//!
//! - **Pipeline**: one worker thread per stage, crossbeam-backed bounded
//!   queues with backpressure and end-of-stream propagation
//! - **Operators**: linear encoding/regularization operators and nonlinear
//!   TV penalties over `ndarray` arrays, FFTs via `rustfft`
//! - **Solvers**: preconditioned conjugate gradient and a gradient-projection
//!   method with Barzilai–Borwein steps
//!
//! ## Configuration
//!
//! A run is described by a TOML file; see [`config`]. Without one the
//! default chain (noise adjust, accumulator, CG-SENSE) is used.
//!
//! ## Example
//!
//! ```ignore
//! use recon_rs::{
//!     config::ReconConfig,
//!     phantom::{Phantom, PhantomSpec},
//!     pipeline::{PipelineBuilder, RunOutput},
//! };
//!
//! fn main() -> recon_rs::Result<()> {
//!     let config = ReconConfig::default();
//!     let pipeline = PipelineBuilder::from_config(&config).build()?;
//!     let stream = Phantom::new(PhantomSpec::default())?.stream()?;
//!
//!     let RunOutput { output: images, report, .. } = pipeline.start()?.run(stream)?;
//!     println!("{} images, {}", images.len(), report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod array;
pub mod config;
pub mod device;
pub mod error;
pub mod job;
pub mod operators;
pub mod phantom;
pub mod pipeline;
pub mod solvers;

// Re-export commonly used types
pub use config::{ClampPolicy, ReconConfig, StageOptions};
pub use error::{ReconError, Result};
pub use job::ReconJob;
pub use pipeline::{Message, MessageKind, PipelineBuilder, PipelineReport, RunOutput, StageKind};
pub use solvers::{CgSolver, GpBbSolver, SolveResult, Solver, SolverSettings};
