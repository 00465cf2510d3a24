//! Info command implementation.

use anyhow::{Context as _, Result};
use roastlink_core::DeviceInfoReader;

use crate::cli::{DeviceArgs, OutputFormat};
use crate::commands::Context;
use crate::format::format_info_text;
use crate::util::{connect, open_manager, write_output};

pub async fn cmd_info(ctx: &Context<'_>, device: DeviceArgs, format: OutputFormat) -> Result<()> {
    let manager = open_manager(ctx.config, device.timeout).await?;
    let show_progress = !ctx.quiet && matches!(format, OutputFormat::Text);
    connect(
        &manager,
        ctx.config,
        ctx.config_path,
        device.device,
        show_progress,
    )
    .await?;

    let report = DeviceInfoReader::new(manager.clone())
        .read_if_needed()
        .await
        .context("Failed to read analyzer info");
    manager.disconnect().await.ok();
    let report = report?;

    for (field, err) in &report.failures {
        tracing::warn!("Could not read {}: {}", field, err);
    }

    let content = match format {
        OutputFormat::Json => ctx.opts.as_json(&report.info)?,
        OutputFormat::Text => format_info_text(&report.info, &ctx.opts),
    };
    write_output(ctx.output, &content)
}
