//! recon-rs - Main Entry Point
//!
//! Runs the configured reconstruction chain over a synthetic phantom scan and
//! prints the run report as JSON.
//!
//! ```text
//! recon-rs [config.toml]
//! ```

use anyhow::Context;
use recon_rs::{
    array,
    config::{LoggingSettings, ReconConfig, DEFAULT_LOG_FILTER},
    phantom::{Phantom, PhantomSpec},
    pipeline::{MessageFlags, PipelineBuilder, RunOutput, StageKind},
};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Jobs synthesised per run
const PHANTOM_JOBS: usize = 2;

fn init_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(settings.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "recon.log"));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

/// Size the phantom after the accumulator settings.
fn phantom_spec(config: &ReconConfig) -> anyhow::Result<PhantomSpec> {
    let mut spec = PhantomSpec::default();
    if let Some(stage) = config.stages.iter().find(|s| s.kind == StageKind::Accumulator) {
        let n = stage.options.int_or("matrix_size", spec.matrix_size as i64)?;
        let ppf = stage.options.int_or("profiles_per_frame", n)?;
        let frames = stage.options.int_or("frames_per_reconstruction", 1)?;
        spec.matrix_size = usize::try_from(n).context("matrix_size must be positive")?;
        spec.profiles_per_frame = usize::try_from(ppf)
            .context("profiles_per_frame must be positive")?
            .min(spec.matrix_size);
        spec.frames = usize::try_from(frames).context("frames_per_reconstruction must be positive")?
            * PHANTOM_JOBS;
    }
    if config.stages.iter().any(|s| s.kind == StageKind::NoiseAdjust) {
        spec.noise_std = 0.01;
    }
    Ok(spec)
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => ReconConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ReconConfig::load_or_default(None),
    };

    let _log_guard = init_logging(&config.logging);
    tracing::info!("Starting recon-rs with {} stages", config.stages.len());

    let spec = phantom_spec(&config)?;
    tracing::info!(
        "Phantom: {}x{} matrix, {} coils, {} frames, {} lines per frame",
        spec.matrix_size,
        spec.matrix_size,
        spec.coils,
        spec.frames,
        spec.profiles_per_frame
    );
    let stream = Phantom::new(spec)?.stream()?;

    let pipeline = PipelineBuilder::from_config(&config)
        .build()
        .context("Failed to build pipeline")?;
    let RunOutput { output: images, report, .. } = pipeline.start()?.run(stream)?;

    for image in &images {
        let header = image.header();
        let peak = image.samples().map(array::amax).unwrap_or(0.0);
        tracing::info!(
            "Image {} (series {}, frame {}): peak {:.4}{}",
            header.counters.image_index,
            header.counters.image_series,
            header.counters.frame,
            peak,
            if header.flags.contains(MessageFlags::NOT_CONVERGED) {
                ", not converged"
            } else {
                ""
            }
        );
    }

    println!("{}", report.to_json()?);

    if !report.is_success() {
        anyhow::bail!(
            "Reconstruction failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    tracing::info!(
        "Reconstructed {} images, {} convergence warnings",
        images.len(),
        report.convergence_warnings()
    );
    Ok(())
}
