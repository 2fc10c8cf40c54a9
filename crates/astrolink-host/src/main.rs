//! astrolink host
//!
//! Loads a device list, connects every driver and runs each one on its own
//! dispatch task until Ctrl-C. Property updates and frames go to the log.
//!
//! Usage: `astrolink [config.json]`; without an argument the file at
//! [`HostConfig::default_path`] is used.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use astrolink_core::config::{ConfigStore, JsonConfigStore};
use astrolink_core::devices::toupcam::ToupCamera;
use astrolink_core::prelude::*;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn config_path() -> Result<PathBuf> {
    match std::env::args_os().nth(1) {
        Some(path) => Ok(PathBuf::from(path)),
        None => HostConfig::default_path().context("no configuration directory"),
    }
}

/// Cameras from one config section and where their choices are saved
struct CameraSet {
    cameras: Vec<ToupCamera>,
    state_file: Option<PathBuf>,
}

fn build_drivers(
    config: &HostConfig,
    clock: Arc<dyn Clock>,
) -> Result<(Vec<Box<dyn Driver>>, Vec<CameraSet>)> {
    let mut drivers: Vec<Box<dyn Driver>> = Vec::new();
    let mut cameras = Vec::new();

    for device in &config.devices {
        match device {
            DeviceConfig::Microtouch(c) => {
                let factory = if c.simulate {
                    tracing::info!("{}: using the firmware simulator", c.name);
                    shared_factory(MicrotouchSimulator::new(clock.clone()))
                } else {
                    serial_factory(&c.serial)
                };
                drivers.push(Box::new(Microtouch::new(
                    c.clone(),
                    factory,
                    Box::new(LogSink),
                    clock.clone(),
                )));
            }
            DeviceConfig::StarGo(c) => {
                drivers.push(Box::new(StarGoMount::new(
                    c.clone(),
                    serial_factory(&c.serial),
                    Box::new(LogSink),
                    Box::new(LogSink),
                    clock.clone(),
                )));
            }
            DeviceConfig::Toupcam(c) => {
                if !c.simulate {
                    bail!(
                        "{}: no ToupTek SDK binding in this build, set \"simulate\": true",
                        c.name
                    );
                }
                let sdk: Arc<dyn CameraSdk> = Arc::new(SimulatedCameraSdk::new(clock.clone()));
                let registry = CameraRegistry::discover(
                    sdk,
                    |_| Box::new(LogSink),
                    clock.clone(),
                    Duration::from_millis(c.poll_interval_ms),
                );
                cameras.push(CameraSet {
                    cameras: registry.into_drivers(),
                    state_file: c.state_file.clone(),
                });
            }
        }
    }
    Ok((drivers, cameras))
}

fn save_camera(camera: &ToupCamera, path: &Path) -> Result<()> {
    let mut store = JsonConfigStore::open(path)?;
    camera.save_config(&mut store as &mut dyn ConfigStore)?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    let path = config_path()?;
    let config =
        HostConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(
        "astrolink {} with {} device section(s) from {}",
        astrolink_core::VERSION,
        config.devices.len(),
        path.display()
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (drivers, camera_sets) = build_drivers(&config, clock)?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for mut driver in drivers {
        if !driver.connect() {
            tracing::warn!("{}: connect failed, not started", driver.name());
            continue;
        }
        let token = shutdown.clone();
        tasks.spawn(async move {
            run_driver(driver.as_mut(), token).await;
        });
    }

    for set in camera_sets {
        for mut camera in set.cameras {
            if !camera.connect() {
                tracing::warn!("{}: connect failed, not started", camera.name());
                continue;
            }
            let token = shutdown.clone();
            let state_file = set.state_file.clone();
            tasks.spawn(async move {
                run_driver(&mut camera, token).await;
                if let Some(path) = state_file {
                    if let Err(e) = save_camera(&camera, &path) {
                        tracing::warn!("{}: could not save settings: {:#}", camera.name(), e);
                    }
                }
            });
        }
    }

    if tasks.is_empty() {
        bail!("no device connected");
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("stopping {} driver(s)", tasks.len());
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("driver task failed: {}", e);
        }
    }
    Ok(())
}
