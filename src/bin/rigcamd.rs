//! rigcamd - lab bench capture daemon
//!
//! Opens the configured camera, starts the capture pipeline and background
//! tasks, and serves the local HTTP API until interrupted. A capture failure
//! ends the live stream but the daemon keeps serving control requests; a
//! restart is the only way to resume frames.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rigcam::api::{ApiConfig, ApiServer};
use rigcam::{Pipeline, RigcamConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file path (overrides RIGCAM_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Camera URI override (stub://... or a V4L2 device path).
    #[arg(long)]
    camera: Option<String>,
    /// Data directory override.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RigcamConfig::load_from(args.config.as_deref())?;
    if let Some(camera) = args.camera {
        cfg.camera.uri = camera;
    }
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }

    let pipeline = Pipeline::start(&cfg)?;
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        pipeline.clone(),
    )
    .spawn()?;
    log::info!("rigcamd {} serving on {}", env!("CARGO_PKG_VERSION"), api_handle.addr);
    log::info!(
        "camera={} data_dir={} retention_max_age={}s",
        cfg.camera.uri,
        cfg.data_dir.display(),
        cfg.retention.max_age.as_secs()
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let ctrlc_flag = interrupted.clone();
    ctrlc::set_handler(move || {
        ctrlc_flag.store(true, Ordering::SeqCst);
    })?;

    let mut last_health_log = Instant::now();
    while !interrupted.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
        if last_health_log.elapsed() >= Duration::from_secs(5) {
            log::info!(
                "health: capturing={} session_active={} viewers={}",
                pipeline.is_capturing(),
                pipeline.session_active(),
                pipeline.viewer_count()
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("interrupt received, shutting down");
    api_handle.stop()?;
    pipeline.shutdown();
    Ok(())
}
