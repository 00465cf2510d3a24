//! Recent measurements command implementation.

use anyhow::{Context as _, Result};

use crate::cli::OutputFormat;
use crate::commands::Context;
use crate::format::format_recent_text;
use crate::util::{open_gateway, write_output};

pub async fn cmd_recent(ctx: &Context<'_>, limit: usize, format: OutputFormat) -> Result<()> {
    let gateway = open_gateway(ctx.config)?;
    let items = gateway
        .recent(limit)
        .await
        .context("Failed to list measurements")?;

    let content = match format {
        OutputFormat::Json => ctx.opts.as_json(&items)?,
        OutputFormat::Text => format_recent_text(&items, &ctx.opts),
    };
    write_output(ctx.output, &content)
}
