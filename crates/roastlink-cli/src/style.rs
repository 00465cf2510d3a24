//! Visual styling utilities for the CLI.
//!
//! Spinners for long-running BLE operations, colors for measurement phases
//! and battery levels, and table styles.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use roastlink_core::MeasurementPhase;

use crate::cli::StyleMode;

/// Standard spinner tick characters (Braille dots animation)
const SPINNER_TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Standard spinner tick interval
const SPINNER_TICK_MS: u64 = 80;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(SPINNER_TICK_CHARS)
}

/// Create a spinner with `message`.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}

/// Create a spinner for scanning operations.
pub fn scanning_spinner(timeout_secs: u64) -> ProgressBar {
    spinner(format!("Scanning for analyzers... ({}s)", timeout_secs))
}

/// Create a spinner for connecting to an analyzer.
pub fn connecting_spinner(device: &str) -> ProgressBar {
    spinner(format!("Connecting to {}...", device))
}

/// Print to stderr without tearing an active spinner.
pub fn print_suspended(spinner: Option<&ProgressBar>, message: &str) {
    match spinner {
        Some(pb) => pb.suspend(|| eprintln!("{}", message)),
        None => eprintln!("{}", message),
    }
}

/// Battery thresholds (percentage).
pub mod battery {
    pub const LOW: u8 = 20;
    pub const MEDIUM: u8 = 40;
}

/// Format a battery level with a color matching its charge.
pub fn format_battery_colored(percent: u8, no_color: bool) -> String {
    let text = format!("{}%", percent);
    if no_color {
        return text;
    }
    if percent < battery::LOW {
        text.red().to_string()
    } else if percent < battery::MEDIUM {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

/// Format a measurement phase label with color.
pub fn format_phase_colored(phase: MeasurementPhase, no_color: bool) -> String {
    let label = phase.label();
    if no_color {
        return label.to_string();
    }
    match phase {
        MeasurementPhase::Complete => label.green().bold().to_string(),
        MeasurementPhase::Failed | MeasurementPhase::TimedOut => label.red().bold().to_string(),
        MeasurementPhase::Cancelled => label.yellow().to_string(),
        MeasurementPhase::SecondaryPhase => label.magenta().to_string(),
        MeasurementPhase::Started | MeasurementPhase::Receiving => label.cyan().to_string(),
    }
}

/// Bold title, unless colors are off.
pub fn title(text: &str, no_color: bool) -> String {
    if no_color {
        text.to_string()
    } else {
        text.bold().to_string()
    }
}

/// Apply the table style for `style`.
pub fn apply_table_style(table: &mut tabled::Table, style: StyleMode) {
    use tabled::settings::Style;
    match style {
        StyleMode::Rich => {
            table.with(Style::rounded());
        }
        StyleMode::Plain => {
            table.with(Style::blank());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_plain() {
        assert_eq!(format_battery_colored(87, true), "87%");
    }

    #[test]
    fn test_battery_colored_contains_value() {
        for level in [5, 30, 90] {
            assert!(format_battery_colored(level, false).contains(&format!("{level}%")));
        }
    }

    #[test]
    fn test_phase_plain_is_label() {
        assert_eq!(
            format_phase_colored(MeasurementPhase::SecondaryPhase, true),
            MeasurementPhase::SecondaryPhase.label()
        );
    }
}
