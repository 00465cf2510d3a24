//! Offline queue commands.

use anyhow::{Context as _, Result};
use roastlink_store::SqliteQueue;

use crate::cli::OutputFormat;
use crate::commands::Context;
use crate::format::{format_flush_text, format_queue_text};
use crate::util::{open_gateway, write_output};

/// List pending measurements. Works without a backend configured.
pub fn cmd_queue_list(ctx: &Context<'_>, format: OutputFormat) -> Result<()> {
    let path = ctx.config.queue_path();
    let queue = SqliteQueue::open(&path)
        .with_context(|| format!("Failed to open offline queue at {}", path.display()))?;
    let items = queue.items().context("Failed to read offline queue")?;

    let content = match format {
        OutputFormat::Json => ctx.opts.as_json(&items)?,
        OutputFormat::Text => format_queue_text(&items, &ctx.opts),
    };
    write_output(ctx.output, &content)
}

/// Upload everything in the queue now.
pub async fn cmd_queue_flush(ctx: &Context<'_>) -> Result<()> {
    let gateway = open_gateway(ctx.config)?;
    let report = gateway.flush_queue().await;
    if !report.is_clean() {
        tracing::warn!("{} measurement(s) could not be uploaded", report.failed);
    }
    write_output(ctx.output, &format_flush_text(&report))
}
