//! CLI Entry Point for basler-daq
//!
//! Provides command-line interface for:
//! - Printing the camera identification and current settings
//! - Grabbing a run of frames into the frame ring
//!
//! # Usage
//!
//! ```bash
//! basler-daq info
//! basler-daq grab --frames 100 --exposure-ms 20
//! basler-daq --ip 192.168.0.42 grab --frames 10 --trigger external-gate
//! ```

use anyhow::{Context, Result};
use basler_daq::{camera, config::AppConfig, logging};
use clap::{Parser, Subcommand};
use daq_core::{FrameSink, TriggerMode};
use daq_driver_basler::{BaslerCamera, RunEnd};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "basler-daq")]
#[command(about = "Headless acquisition from Basler GigE cameras", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = basler_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Camera IP address or host name, overrides the configuration
    #[arg(long)]
    ip: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print camera identification and settings
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Acquire a run of frames
    Grab {
        /// Frames to acquire
        #[arg(long, default_value_t = 1)]
        frames: u64,

        /// Exposure time in milliseconds
        #[arg(long)]
        exposure_ms: Option<f64>,

        /// Trigger mode (internal, external-gate, external-trigger-single)
        #[arg(long)]
        trigger: Option<TriggerMode>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(ip) = cli.ip {
        config.camera.ip = ip;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config.application)?;

    let ring = camera::frame_ring(&config);
    let cam = camera::open(&config, &ring).await?;

    let result = match cli.command {
        Commands::Info { json } => print_info(&cam, json).await,
        Commands::Grab {
            frames,
            exposure_ms,
            trigger,
        } => grab(&cam, &ring, &config, frames, exposure_ms, trigger).await,
    };

    // Close the camera even when the command failed
    cam.shutdown().await.context("camera shutdown failed")?;
    result
}

async fn print_info(cam: &BaslerCamera, json: bool) -> Result<()> {
    let detector = cam.detector_info().await?;
    let size = cam.image_size().await?;
    let image_type = cam.image_type().await?;
    let exposure_ms = cam.exposure_time().await?;
    let frame_rate = cam.frame_rate().await?;
    let trigger = cam.trigger_mode().await?;
    let (pixel_x, pixel_y) = cam.pixel_size();

    if json {
        let report = serde_json::json!({
            "detector": detector,
            "image_size": size,
            "image_type": image_type,
            "exposure_ms": exposure_ms,
            "frame_rate_hz": frame_rate,
            "trigger_mode": trigger,
            "pixel_size_um": [pixel_x, pixel_y],
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Camera:      {} {}", detector.vendor, detector.model);
    println!("Serial:      {}", detector.serial_number);
    println!("Address:     {}", detector.ip_address);
    println!("Image:       {} {:?}", size, image_type);
    println!("Pixel size:  {} x {} um", pixel_x, pixel_y);
    println!("Exposure:    {:.3} ms", exposure_ms);
    println!("Frame rate:  {:.2} Hz", frame_rate);
    println!("Trigger:     {}", trigger);
    Ok(())
}

async fn grab(
    cam: &BaslerCamera,
    ring: &daq_pool::FrameRing,
    config: &AppConfig,
    frames: u64,
    exposure_ms: Option<f64>,
    trigger: Option<TriggerMode>,
) -> Result<()> {
    if let Some(exposure_ms) = exposure_ms {
        cam.set_exposure_time(exposure_ms).await?;
    }
    if let Some(trigger) = trigger {
        cam.set_trigger_mode(trigger).await?;
    }
    cam.set_nb_frames(frames).await?;

    // One poll for the transfer plus the stop sequence after a timeout
    let stall = config.acquisition.poll_timeout.saturating_mul(2);

    let mut ready = ring.subscribe();
    cam.start().await.context("failed to start acquisition")?;
    info!(frames, "Acquisition started");

    let wait = camera::wait_for_run_end(cam, stall);
    tokio::pin!(wait);
    let snapshot = loop {
        tokio::select! {
            snapshot = &mut wait => break snapshot?,
            frame = ready.recv() => match frame {
                Ok(frame) => debug!(frame_nb = frame.frame_nb, elapsed = ?frame.elapsed, "Frame ready"),
                Err(RecvError::Lagged(missed)) => debug!(missed, "Frame announcements skipped"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping acquisition");
                cam.stop().await?;
            }
        }
    };

    let Some(run) = snapshot.last_run else {
        anyhow::bail!("acquisition ended without a run summary");
    };
    let elapsed = ring
        .start_timestamp()
        .map(chrono_elapsed)
        .unwrap_or_default();

    println!(
        "Acquired {}/{} frames in {:.3} s ({} failed transfers)",
        run.frames_acquired,
        run.nb_frames,
        elapsed.as_secs_f64(),
        run.failed_transfers
    );
    match run.end {
        RunEnd::Completed | RunEnd::Stopped => Ok(()),
        RunEnd::Timeout => anyhow::bail!("acquisition timed out waiting for a frame"),
        RunEnd::Aborted => anyhow::bail!("acquisition aborted, see log for the cause"),
    }
}

fn chrono_elapsed(start: chrono::DateTime<chrono::Utc>) -> Duration {
    (chrono::Utc::now() - start).to_std().unwrap_or(Duration::ZERO)
}
