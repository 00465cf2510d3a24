//! Command implementations for the CLI.

mod config;
mod info;
mod measure;
mod queue;
mod recent;
mod scan;

pub use config::cmd_config;
pub use info::cmd_info;
pub use measure::cmd_measure;
pub use queue::{cmd_queue_flush, cmd_queue_list};
pub use recent::cmd_recent;
pub use scan::cmd_scan;

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::format::FormatOptions;

/// State shared by every command.
pub struct Context<'a> {
    pub config: &'a Config,
    pub config_path: &'a Path,
    pub output: Option<&'a PathBuf>,
    pub quiet: bool,
    pub opts: FormatOptions,
}
