//! Scan command implementation.

use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::cli::OutputFormat;
use crate::commands::Context;
use crate::format::{format_scan_json, format_scan_text};
use crate::style;
use crate::util::{open_manager, write_output};

pub async fn cmd_scan(ctx: &Context<'_>, timeout: u64, format: OutputFormat) -> Result<()> {
    let manager = open_manager(ctx.config, None).await?;

    let spinner = if !ctx.quiet && matches!(format, OutputFormat::Text) {
        Some(style::scanning_spinner(timeout))
    } else {
        None
    };

    let report = manager
        .scan(Duration::from_secs(timeout))
        .await
        .context("Failed to scan for analyzers")?;

    if let Some(sp) = spinner {
        sp.finish_and_clear();
    }

    let content = match format {
        OutputFormat::Json => format_scan_json(&report, &ctx.opts)?,
        OutputFormat::Text => format_scan_text(&report, &ctx.opts),
    };
    write_output(ctx.output, &content)
}
