//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use roastlink_types::{CoffeeType, LinkKind, LinkTarget};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Visual styling mode for output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StyleMode {
    /// Rounded tables with colors (default)
    #[default]
    Rich,
    /// Plain text with no decorations (for scripting)
    Plain,
}

/// Reusable device connection arguments
#[derive(Debug, Clone, Args)]
pub struct DeviceArgs {
    /// Analyzer address (MAC address or UUID), or use ROASTLINK_DEVICE env var
    #[arg(short, long, env = "ROASTLINK_DEVICE")]
    pub device: Option<String>,

    /// Connection timeout in seconds (overrides config)
    #[arg(short = 'T', long)]
    pub timeout: Option<u64>,
}

/// Coffee type accepted on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum CoffeeTypeArg {
    /// Let the analyzer detect the sample
    #[default]
    Auto,
    /// Green (unroasted) beans
    Green,
    /// Roasted beans
    Roasted,
}

impl From<CoffeeTypeArg> for CoffeeType {
    fn from(arg: CoffeeTypeArg) -> Self {
        match arg {
            CoffeeTypeArg::Auto => CoffeeType::Auto,
            CoffeeTypeArg::Green => CoffeeType::Green,
            CoffeeTypeArg::Roasted => CoffeeType::Roasted,
        }
    }
}

/// Kind of record a measurement is linked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LinkKindArg {
    /// Green coffee inventory lot
    Inventory,
    /// Roast batch
    Roast,
}

impl From<LinkKindArg> for LinkKind {
    fn from(arg: LinkKindArg) -> Self {
        match arg {
            LinkKindArg::Inventory => LinkKind::Inventory,
            LinkKindArg::Roast => LinkKind::Roast,
        }
    }
}

/// Arguments of the `measure` command
#[derive(Debug, Clone, Args)]
pub struct MeasureArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Coffee type of the sample
    #[arg(short, long, value_enum, default_value = "auto")]
    pub coffee_type: CoffeeTypeArg,

    /// Link the measurement to an inventory lot or roast batch
    #[arg(long, value_enum, requires = "link_id")]
    pub link_type: Option<LinkKindArg>,

    /// Id of the linked lot or batch
    #[arg(long, requires = "link_type")]
    pub link_id: Option<String>,

    /// Do not save the result to the backend
    #[arg(long)]
    pub no_save: bool,

    /// Write the session debug log to this file on exit
    #[arg(long, value_name = "PATH")]
    pub debug_log: Option<PathBuf>,

    /// Measurement timeout in seconds (overrides config)
    #[arg(long)]
    pub measurement_timeout: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl MeasureArgs {
    /// The link target, if both parts were given.
    pub fn link(&self) -> Option<LinkTarget> {
        match (self.link_type, &self.link_id) {
            (Some(kind), Some(id)) => Some(LinkTarget::new(kind.into(), id.clone())),
            _ => None,
        }
    }
}

#[derive(Parser)]
#[command(name = "roastlink")]
#[command(author, version, about = "CLI for the roastlink coffee analyzer", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output compact JSON (no pretty-printing)
    #[arg(long, global = true)]
    pub compact: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Visual styling mode (rich, plain)
    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "rich",
        env = "ROASTLINK_STYLE"
    )]
    pub style: StyleMode,

    /// Use this configuration file instead of the default
    #[arg(long, global = true, env = "ROASTLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write output to file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan for nearby analyzers
    Scan {
        /// Scan window in seconds
        #[arg(short, long, default_value = "8")]
        timeout: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Display analyzer information (serial, firmware, model, battery)
    Info {
        #[command(flatten)]
        device: DeviceArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run a measurement and save the result
    Measure(MeasureArgs),

    /// Inspect or upload measurements waiting in the offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// List recent measurements from the backend
    Recent {
        /// Number of measurements to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Offline queue subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum QueueAction {
    /// List pending measurements
    #[command(alias = "ls")]
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Upload pending measurements now
    Flush,
}

/// Configuration subcommands
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Show configuration file path
    Path,

    /// Show current configuration
    Show,
}
