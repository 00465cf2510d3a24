//! Config command implementation.

use anyhow::{Context as _, Result};

use crate::cli::ConfigAction;
use crate::commands::Context;
use crate::util::write_output;

pub fn cmd_config(ctx: &Context<'_>, action: ConfigAction) -> Result<()> {
    let content = match action {
        ConfigAction::Path => format!("{}\n", ctx.config_path.display()),
        ConfigAction::Show => {
            let shown = toml::to_string_pretty(&ctx.config.redacted())
                .context("Failed to serialize config")?;
            if !ctx.config_path.exists() && !ctx.quiet {
                eprintln!(
                    "# {} does not exist; showing defaults",
                    ctx.config_path.display()
                );
            }
            shown
        }
    };
    write_output(ctx.output, &content)
}
