//! Output formatting for CLI commands.

use anyhow::Result;
use serde::Serialize;
use tabled::builder::Builder;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use roastlink_core::{
    DeviceHandle, FlushReport, MeasurementPhase, RemoteMeasurement, SaveOutcome, ScanReport,
    SessionState, SyncQueueItem,
};
use roastlink_types::{CoffeeType, DeviceInfo, MeasurementReading};

use crate::cli::StyleMode;
use crate::style;

/// Formatting options shared by all commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
    /// Use compact JSON output (no pretty-printing).
    pub compact: bool,
    /// Visual styling mode.
    pub style: StyleMode,
}

impl FormatOptions {
    pub fn new(no_color: bool, style: StyleMode) -> Self {
        // Plain mode automatically disables colors for pipe-friendliness
        Self {
            no_color: no_color || style == StyleMode::Plain,
            compact: false,
            style,
        }
    }

    /// Create with compact JSON option.
    pub fn with_compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Serialize value to JSON string, respecting compact option.
    pub fn as_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.compact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        Ok(json + "\n")
    }

    fn table(&self, builder: Builder) -> String {
        let mut table = builder.build();
        style::apply_table_style(&mut table, self.style);
        table.to_string()
    }
}

fn timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

fn value_or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

// ============================================================================
// Scan
// ============================================================================

/// Serializable view of a discovered analyzer.
#[derive(Debug, Serialize)]
pub struct ScanEntry<'a> {
    pub id: &'a str,
    pub name: Option<&'a str>,
    pub rssi: Option<i16>,
}

impl<'a> From<&'a DeviceHandle> for ScanEntry<'a> {
    fn from(device: &'a DeviceHandle) -> Self {
        Self {
            id: &device.id,
            name: device.name.as_deref(),
            rssi: device.rssi,
        }
    }
}

pub fn format_scan_text(report: &ScanReport, opts: &FormatOptions) -> String {
    if report.devices.is_empty() {
        let reason = report
            .diagnostic
            .as_ref()
            .map_or_else(|| "No analyzers found.".to_string(), |d| d.message());
        return format!("{}\n", reason);
    }

    let mut builder = Builder::default();
    builder.push_record(["Name", "Address", "RSSI"]);
    for device in &report.devices {
        builder.push_record([
            device.display_name().to_string(),
            device.id.clone(),
            device
                .rssi
                .map_or_else(|| "-".to_string(), |r| format!("{} dBm", r)),
        ]);
    }

    let count = report.devices.len();
    let header = format!(
        "Found {} analyzer{}",
        count,
        if count == 1 { "" } else { "s" }
    );
    format!(
        "{}\n{}\n",
        style::title(&header, opts.no_color),
        opts.table(builder)
    )
}

pub fn format_scan_json(report: &ScanReport, opts: &FormatOptions) -> Result<String> {
    let devices: Vec<ScanEntry<'_>> = report.devices.iter().map(ScanEntry::from).collect();
    opts.as_json(&serde_json::json!({
        "devices": devices,
        "diagnostic": report.diagnostic.as_ref().map(|d| d.message()),
    }))
}

// ============================================================================
// Device info
// ============================================================================

pub fn format_info_text(info: &DeviceInfo, opts: &FormatOptions) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Property", "Value"]);
    builder.push_record(["Model".to_string(), value_or_dash(info.model.as_deref())]);
    builder.push_record(["Serial".to_string(), value_or_dash(info.serial.as_deref())]);
    builder.push_record([
        "Firmware".to_string(),
        value_or_dash(info.firmware.as_deref()),
    ]);
    builder.push_record([
        "Battery".to_string(),
        info.battery.map_or_else(
            || "-".to_string(),
            |b| style::format_battery_colored(b, opts.no_color),
        ),
    ]);

    format!(
        "{}\n{}\n",
        style::title("Analyzer Information", opts.no_color),
        opts.table(builder)
    )
}

// ============================================================================
// Measurements
// ============================================================================

fn field_label(name: &str) -> String {
    let spaced = name.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn format_reading_text(reading: &MeasurementReading, opts: &FormatOptions) -> String {
    if reading.is_empty() {
        return "No values received.\n".to_string();
    }

    let mut builder = Builder::default();
    builder.push_record(["Value", "Reading"]);
    for (field, value) in reading.present() {
        let unit = field.unit();
        let shown = if unit.is_empty() {
            format!("{:.2}", value)
        } else {
            format!("{:.2} {}", value, unit)
        };
        builder.push_record([field_label(field.name()), shown]);
    }
    format!("{}\n", opts.table(builder))
}

/// Serializable summary of a finished session.
#[derive(Debug, Serialize)]
pub struct SessionSummary<'a> {
    pub client_id: Uuid,
    pub coffee_type: CoffeeType,
    pub phase: MeasurementPhase,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub reading: &'a MeasurementReading,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<&'a SaveOutcome>,
}

impl<'a> SessionSummary<'a> {
    pub fn new(session: &'a SessionState, saved: Option<&'a SaveOutcome>) -> Self {
        Self {
            client_id: session.client_id,
            coffee_type: session.coffee_type,
            phase: session.phase,
            started_at: session.started_at,
            completed_at: session.completed_at,
            reading: &session.reading,
            device_serial: session.device_serial.as_deref(),
            failure: session.failure.as_deref(),
            saved,
        }
    }
}

pub fn format_session_text(session: &SessionState, opts: &FormatOptions) -> String {
    let mut out = format!(
        "{} {} ({})\n",
        style::title("Measurement", opts.no_color),
        session.client_id,
        session.coffee_type
    );
    out.push_str(&format!(
        "Phase: {}\n",
        style::format_phase_colored(session.phase, opts.no_color)
    ));
    if let Some(completed) = session.completed_at {
        let elapsed = completed - session.started_at;
        out.push_str(&format!(
            "Duration: {:.1}s\n",
            elapsed.as_seconds_f64()
        ));
    }
    if let Some(reason) = &session.failure {
        out.push_str(&format!("Reason: {}\n", reason));
    }
    out.push_str(&format_reading_text(&session.reading, opts));
    out
}

pub fn format_save_outcome_text(outcome: &SaveOutcome) -> String {
    match outcome {
        SaveOutcome::Saved {
            remote_id: Some(id),
        } => format!("Saved (id {}).\n", id),
        SaveOutcome::Saved { remote_id: None } => "Saved.\n".to_string(),
        SaveOutcome::OfflineQueued { client_id } => format!(
            "Backend unavailable; measurement {} queued for upload.\n",
            client_id
        ),
    }
}

// ============================================================================
// Offline queue
// ============================================================================

pub fn format_queue_text(items: &[SyncQueueItem], opts: &FormatOptions) -> String {
    if items.is_empty() {
        return "Offline queue is empty.\n".to_string();
    }

    let mut builder = Builder::default();
    builder.push_record(["Client id", "Coffee", "Queued", "Link", "Attempts", "Last error"]);
    for item in items {
        let link = item
            .payload
            .link()
            .map_or_else(|| "-".to_string(), |l| format!("{}:{}", l.kind, l.id));
        builder.push_record([
            item.client_id.to_string(),
            item.payload.coffee_type.to_string(),
            timestamp(item.enqueued_at),
            link,
            item.attempts.to_string(),
            value_or_dash(item.last_error.as_deref()),
        ]);
    }
    format!(
        "{}\n{}\n",
        style::title(&format!("{} pending", items.len()), opts.no_color),
        opts.table(builder)
    )
}

pub fn format_flush_text(report: &FlushReport) -> String {
    let mut out = format!(
        "Uploaded {}, already on backend {}, failed {}.\n",
        report.submitted, report.duplicates, report.failed
    );
    if report.remaining > 0 {
        out.push_str(&format!("{} still pending.\n", report.remaining));
    }
    out
}

// ============================================================================
// Recent measurements
// ============================================================================

pub fn format_recent_text(items: &[RemoteMeasurement], opts: &FormatOptions) -> String {
    if items.is_empty() {
        return "No measurements on the backend.\n".to_string();
    }

    let mut builder = Builder::default();
    builder.push_record(["Id", "Created", "Coffee", "Moisture", "aw", "Link"]);
    for item in items {
        let link = match (&item.linked_type, &item.linked_id) {
            (Some(kind), Some(id)) => format!("{}:{}", kind, id),
            _ => "-".to_string(),
        };
        builder.push_record([
            item.id.clone(),
            timestamp(item.created_at),
            item.coffee_type.to_string(),
            item.reading
                .moisture
                .map_or_else(|| "-".to_string(), |m| format!("{:.2} %", m)),
            item.reading
                .water_activity
                .map_or_else(|| "-".to_string(), |a| format!("{:.3}", a)),
            link,
        ]);
    }
    format!("{}\n", opts.table(builder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use roastlink_core::ScanDiagnostic;
    use roastlink_core::persistence::MeasurementPayload;
    use roastlink_types::{LinkTarget, MeasurementField};

    fn plain() -> FormatOptions {
        FormatOptions::new(true, StyleMode::Plain)
    }

    #[test]
    fn test_field_label() {
        assert_eq!(field_label("water_activity"), "Water activity");
        assert_eq!(field_label("agtron"), "Agtron");
        assert_eq!(field_label(""), "");
    }

    #[test]
    fn test_scan_empty_shows_diagnostic() {
        let report = ScanReport {
            devices: Vec::new(),
            diagnostic: Some(ScanDiagnostic::AdapterOff),
        };
        assert_eq!(format_scan_text(&report, &plain()), "Bluetooth is off\n");
    }

    #[test]
    fn test_scan_lists_devices() {
        let mut device = DeviceHandle::new("AA:BB:CC:DD:EE:01");
        device.name = Some("CoffeeLab 0042".to_string());
        device.rssi = Some(-61);
        let report = ScanReport {
            devices: vec![device],
            diagnostic: None,
        };

        let text = format_scan_text(&report, &plain());
        assert!(text.contains("Found 1 analyzer\n"));
        assert!(text.contains("CoffeeLab 0042"));
        assert!(text.contains("-61 dBm"));

        let json: serde_json::Value =
            serde_json::from_str(&format_scan_json(&report, &plain()).unwrap()).unwrap();
        assert_eq!(json["devices"][0]["id"], "AA:BB:CC:DD:EE:01");
        assert!(json["diagnostic"].is_null());
    }

    #[test]
    fn test_info_text_marks_missing_values() {
        let info = DeviceInfo {
            serial: Some("CL-2041-0042".to_string()),
            firmware: None,
            model: Some("CoffeeLab Pro".to_string()),
            battery: Some(87),
        };
        let text = format_info_text(&info, &plain());
        assert!(text.contains("CL-2041-0042"));
        assert!(text.contains("87%"));
        assert!(text.contains('-'));
    }

    #[test]
    fn test_session_text() {
        let mut session = SessionState::new(CoffeeType::Green, None);
        session.reading.set(MeasurementField::Moisture, 10.5);
        session.reading.set(MeasurementField::Density, 701.0);
        session.complete();

        let text = format_session_text(&session, &plain());
        assert!(text.contains("Phase: complete"));
        assert!(text.contains("Moisture"));
        assert!(text.contains("10.50 %"));
        assert!(text.contains("701.00 g/L"));
    }

    #[test]
    fn test_session_summary_json() {
        let mut session = SessionState::new(CoffeeType::Roasted, None);
        session.fail(MeasurementPhase::TimedOut, "no completion");
        let summary = SessionSummary::new(&session, None);
        let json: serde_json::Value =
            serde_json::from_str(&plain().as_json(&summary).unwrap()).unwrap();
        assert_eq!(json["phase"], "timed_out");
        assert_eq!(json["failure"], "no completion");
        assert!(json.get("saved").is_none());
    }

    #[test]
    fn test_queue_text() {
        assert_eq!(format_queue_text(&[], &plain()), "Offline queue is empty.\n");

        let mut session = SessionState::new(CoffeeType::Auto, None);
        session.reading.set(MeasurementField::Moisture, 9.0);
        session.complete();
        let payload =
            MeasurementPayload::from_session(&session, Some(&LinkTarget::roast("roast-3")));
        let mut item = SyncQueueItem::new(payload);
        item.record_failure("HTTP 503");

        let text = format_queue_text(&[item], &plain());
        assert!(text.contains("1 pending"));
        assert!(text.contains("roast:roast-3"));
        assert!(text.contains("HTTP 503"));
    }

    #[test]
    fn test_flush_text() {
        let report = FlushReport {
            submitted: 2,
            duplicates: 1,
            failed: 1,
            remaining: 1,
        };
        let text = format_flush_text(&report);
        assert!(text.contains("Uploaded 2"));
        assert!(text.contains("1 still pending"));
    }
}
