//! Utility functions for CLI operations.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dialoguer::{Select, theme::ColorfulTheme};
use roastlink_core::{
    BtleplugAdapter, ConnectionManager, DeviceHandle, HttpMeasurementApi, PersistenceGateway,
    ScanReport,
};
use roastlink_store::SqliteQueue;

use crate::config::{Config, update_bonded_device};
use crate::style;

/// Scan window used to locate an analyzer before connecting.
pub const LOCATE_WINDOW: Duration = Duration::from_secs(8);

/// Open the platform Bluetooth adapter and wrap it in a connection manager.
pub async fn open_manager(config: &Config, connect_timeout: Option<u64>) -> Result<ConnectionManager> {
    let adapter = BtleplugAdapter::new()
        .await
        .context("Failed to open Bluetooth adapter")?;
    let manager = ConnectionManager::new(Arc::new(adapter), config.connection_config(connect_timeout)?)
        .context("Invalid connection configuration")?;
    if let Some(bonded) = &config.bonded_device {
        manager.set_bonded_device(Some(bonded.clone()));
    }
    Ok(manager)
}

/// Scan and describe why nothing usable was found.
async fn scan_or_explain(manager: &ConnectionManager, show_progress: bool) -> Result<ScanReport> {
    let spinner = show_progress.then(|| style::scanning_spinner(LOCATE_WINDOW.as_secs()));
    let report = manager
        .scan(LOCATE_WINDOW)
        .await
        .context("Failed to scan for analyzers")?;
    if let Some(sp) = spinner {
        sp.finish_and_clear();
    }
    if report.devices.is_empty() {
        let reason = report
            .diagnostic
            .as_ref()
            .map_or_else(|| "No analyzers found".to_string(), |d| d.message());
        bail!("{}", reason);
    }
    Ok(report)
}

/// Pick one analyzer from a scan, prompting when several were found.
fn choose_device(devices: &[DeviceHandle]) -> Result<DeviceHandle> {
    if devices.len() == 1 {
        let dev = &devices[0];
        eprintln!("Found 1 analyzer: {} ({})", dev.display_name(), dev.id);
        return Ok(dev.clone());
    }

    if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
        bail!(
            "Found {} analyzers. Use --device <ADDRESS> or set ROASTLINK_DEVICE to choose one.",
            devices.len()
        );
    }

    let items: Vec<String> = devices
        .iter()
        .map(|d| format!("{} ({})", d.display_name(), d.id))
        .collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select an analyzer")
        .items(&items)
        .default(0)
        .interact()
        .context("Failed to read selection")?;
    Ok(devices[selection].clone())
}

/// Connect to an analyzer.
///
/// An explicit or configured device is located by a short scan and then
/// connected. Without one, the bonded device is auto-connected; failing
/// that, the nearest analyzer is chosen from a scan. The connected device
/// is remembered as the bonded device.
pub async fn connect(
    manager: &ConnectionManager,
    config: &Config,
    config_path: &Path,
    device: Option<String>,
    show_progress: bool,
) -> Result<String> {
    let explicit = device.or_else(|| config.device.clone());

    if explicit.is_none() && manager.bonded_device().is_some() {
        let spinner = show_progress.then(|| style::spinner("Reconnecting to bonded analyzer..."));
        let connected = manager.auto_connect().await;
        if let Some(sp) = spinner {
            sp.finish_and_clear();
        }
        if connected && let Some(id) = manager.device_id() {
            return Ok(id);
        }
        style::print_suspended(None, "Bonded analyzer not reachable, scanning instead.");
    }

    let report = scan_or_explain(manager, show_progress).await?;
    let target = match explicit {
        Some(id) => report
            .devices
            .iter()
            .find(|d| d.id.eq_ignore_ascii_case(&id))
            .cloned()
            .with_context(|| format!("Analyzer {} not found nearby", id))?,
        None => choose_device(&report.devices)?,
    };

    let spinner = show_progress.then(|| style::connecting_spinner(target.display_name()));
    let result = manager.connect(&target.id).await;
    if let Some(sp) = spinner {
        sp.finish_and_clear();
    }
    result.with_context(|| format!("Failed to connect to {}", target.display_name()))?;

    if let Err(e) = update_bonded_device(config_path, &target.id, target.name.as_deref()) {
        tracing::warn!("Could not remember bonded analyzer: {:#}", e);
    }
    Ok(target.id)
}

/// Build the persistence gateway from the backend settings and offline queue.
pub fn open_gateway(config: &Config) -> Result<PersistenceGateway> {
    let Some(url) = &config.backend.url else {
        bail!(
            "No backend configured. Set backend.url in {}",
            Config::default_path().display()
        );
    };
    let mut api = HttpMeasurementApi::new(url).context("Invalid backend URL")?;
    if let Some(token) = &config.backend.token {
        api = api.with_token(token.clone());
    }
    let queue = SqliteQueue::open(config.queue_path()).context("Failed to open offline queue")?;
    Ok(PersistenceGateway::new(Arc::new(api), Arc::new(queue)))
}

/// Write output to file or stdout
pub fn write_output(output: Option<&PathBuf>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }
        None => {
            print!("{}", content);
            io::stdout().flush()?;
        }
    }
    Ok(())
}
