//! Helios stereo-camera recorder: V4L2 capture to disk under live commands.

use std::io;
use std::sync::Arc;

use color_eyre::Result;
use tracing::info;

use helios::capture::{CaptureDevice, CaptureSource, DeviceConfig};
use helios::pipeline::{CapturePipeline, CommandController, ControlState, FrameQueue};
use helios::sink::FileSink;
use helios::{utils, Config};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("helios=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Helios launching...");

    // Load configuration: defaults, then helios.toml, then HELIOS_* env
    let config = load_config()?;
    helios::CONFIG.store(Arc::new(config.clone()));

    // Auto-detect capture device if needed
    let mut capture_config = config.capture;
    if capture_config.device.path.is_empty() {
        capture_config.device = utils::auto_detect_device()?;
        capture_config.format = capture_config.device.format;
    }
    info!("Using capture device: {:?}", capture_config.device);

    // Bring the device up at the primary rate
    let mut device = CaptureDevice::open(DeviceConfig::from(&capture_config))?;
    device.start_streaming()?;
    info!("FPS: {}", device.frame_rate());

    let sink = FileSink::new(&config.sink)?;
    let queue = Arc::new(FrameQueue::with_capacity(config.pipeline.queue_capacity));
    let control = Arc::new(ControlState::new());

    let pipeline = CapturePipeline::launch(
        device,
        sink,
        None,
        queue,
        control,
        (capture_config.fps, capture_config.fps_alternate),
    )?;
    info!("write status: {}", pipeline.control().status());

    // The control thread is this one: read commands until `q`
    CommandController::new(pipeline).run(io::stdin().lock())?;

    info!("Application exited.");
    Ok(())
}

fn load_config() -> Result<Config> {
    let defaults = config::Config::try_from(&Config::default())?;
    let settings = config::Config::builder()
        .add_source(defaults)
        .add_source(config::File::with_name("helios").required(false))
        .add_source(config::Environment::with_prefix("HELIOS").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}
