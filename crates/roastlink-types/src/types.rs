//! Core types for analyzer data.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Coffee type selector sent with the start command.
///
/// The analyzer uses different calibrations for green and roasted beans.
/// `Auto` lets the device pick based on its own color check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum CoffeeType {
    /// Let the analyzer detect the sample type.
    #[default]
    Auto = 0x00,
    /// Unroasted (green) coffee.
    Green = 0x01,
    /// Roasted coffee.
    Roasted = 0x02,
}

impl CoffeeType {
    /// All coffee types, in protocol order.
    pub const ALL: [CoffeeType; 3] = [CoffeeType::Auto, CoffeeType::Green, CoffeeType::Roasted];

    /// Protocol byte for this coffee type.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Lowercase name as used in the API and on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CoffeeType::Auto => "auto",
            CoffeeType::Green => "green",
            CoffeeType::Roasted => "roasted",
        }
    }
}

impl TryFrom<u8> for CoffeeType {
    type Error = ParseError;

    /// Convert a protocol byte to a `CoffeeType`.
    ///
    /// # Examples
    ///
    /// ```
    /// use roastlink_types::CoffeeType;
    ///
    /// assert_eq!(CoffeeType::try_from(0x01), Ok(CoffeeType::Green));
    /// assert!(CoffeeType::try_from(0x09).is_err());
    /// ```
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CoffeeType::Auto),
            0x01 => Ok(CoffeeType::Green),
            0x02 => Ok(CoffeeType::Roasted),
            other => Err(ParseError::UnknownCoffeeType(format!("0x{other:02X}"))),
        }
    }
}

impl FromStr for CoffeeType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CoffeeType::Auto),
            "green" => Ok(CoffeeType::Green),
            "roasted" | "roast" => Ok(CoffeeType::Roasted),
            other => Err(ParseError::UnknownCoffeeType(other.to_string())),
        }
    }
}

impl fmt::Display for CoffeeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single value the analyzer can report.
///
/// The discriminant is the field id used in notification records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum MeasurementField {
    /// Moisture content in percent.
    Moisture = 0x01,
    /// Water activity (aw, 0.0 - 1.0).
    WaterActivity = 0x02,
    /// Density in g/L.
    Density = 0x03,
    /// Bulk density in g/L.
    BulkDensity = 0x04,
    /// Agtron roast color number.
    Agtron = 0x05,
    /// Sample weight in grams.
    Weight = 0x06,
    /// Screen size grade.
    ScreenSize = 0x07,
    /// Screen diameter in millimetres.
    ScreenDiameter = 0x08,
    /// Ambient temperature in degrees Celsius.
    AmbientTemperature = 0x09,
    /// Relative humidity in percent.
    Humidity = 0x0A,
    /// Atmospheric pressure in hPa.
    Pressure = 0x0B,
    /// Altitude in metres.
    Altitude = 0x0C,
    /// Water-activity chamber mirror temperature in degrees Celsius.
    MirrorTemperature = 0x0D,
    /// Bean temperature in degrees Celsius.
    BeanTemperature = 0x0E,
}

impl MeasurementField {
    /// Every field, ordered by id.
    pub const ALL: [MeasurementField; 14] = [
        MeasurementField::Moisture,
        MeasurementField::WaterActivity,
        MeasurementField::Density,
        MeasurementField::BulkDensity,
        MeasurementField::Agtron,
        MeasurementField::Weight,
        MeasurementField::ScreenSize,
        MeasurementField::ScreenDiameter,
        MeasurementField::AmbientTemperature,
        MeasurementField::Humidity,
        MeasurementField::Pressure,
        MeasurementField::Altitude,
        MeasurementField::MirrorTemperature,
        MeasurementField::BeanTemperature,
    ];

    /// Field id as used on the wire.
    #[must_use]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Snake-case name of the field (matches the serialized name).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            MeasurementField::Moisture => "moisture",
            MeasurementField::WaterActivity => "water_activity",
            MeasurementField::Density => "density",
            MeasurementField::BulkDensity => "bulk_density",
            MeasurementField::Agtron => "agtron",
            MeasurementField::Weight => "weight",
            MeasurementField::ScreenSize => "screen_size",
            MeasurementField::ScreenDiameter => "screen_diameter",
            MeasurementField::AmbientTemperature => "ambient_temperature",
            MeasurementField::Humidity => "humidity",
            MeasurementField::Pressure => "pressure",
            MeasurementField::Altitude => "altitude",
            MeasurementField::MirrorTemperature => "mirror_temperature",
            MeasurementField::BeanTemperature => "bean_temperature",
        }
    }

    /// Display unit, empty for dimensionless values.
    #[must_use]
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementField::Moisture | MeasurementField::Humidity => "%",
            MeasurementField::WaterActivity
            | MeasurementField::Agtron
            | MeasurementField::ScreenSize => "",
            MeasurementField::Density | MeasurementField::BulkDensity => "g/L",
            MeasurementField::Weight => "g",
            MeasurementField::ScreenDiameter => "mm",
            MeasurementField::AmbientTemperature
            | MeasurementField::MirrorTemperature
            | MeasurementField::BeanTemperature => "°C",
            MeasurementField::Pressure => "hPa",
            MeasurementField::Altitude => "m",
        }
    }

    /// Whether this field belongs to the water-activity chamber readout
    /// that keeps streaming during the secondary phase.
    #[must_use]
    pub fn is_chamber_temperature(self) -> bool {
        matches!(
            self,
            MeasurementField::MirrorTemperature | MeasurementField::BeanTemperature
        )
    }
}

impl TryFrom<u8> for MeasurementField {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MeasurementField::ALL
            .iter()
            .copied()
            .find(|f| f.id() == value)
            .ok_or(ParseError::UnknownField(value))
    }
}

impl fmt::Display for MeasurementField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sparse record of analyzer values for one measurement.
///
/// Every field is optional: the analyzer streams values as they become
/// available, and not every device or coffee type reports every value.
/// Within a session fields only ever go from `None` to `Some`; use
/// [`MeasurementReading::merge`] to accumulate partial readings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeasurementReading {
    /// Moisture content in percent.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub moisture: Option<f32>,
    /// Water activity (aw).
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub water_activity: Option<f32>,
    /// Density in g/L.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub density: Option<f32>,
    /// Bulk density in g/L.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub bulk_density: Option<f32>,
    /// Agtron roast color number.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub agtron: Option<f32>,
    /// Sample weight in grams.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub weight: Option<f32>,
    /// Screen size grade.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub screen_size: Option<f32>,
    /// Screen diameter in millimetres.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub screen_diameter: Option<f32>,
    /// Ambient temperature in degrees Celsius.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub ambient_temperature: Option<f32>,
    /// Relative humidity in percent.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub humidity: Option<f32>,
    /// Atmospheric pressure in hPa.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub pressure: Option<f32>,
    /// Altitude in metres.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub altitude: Option<f32>,
    /// Mirror temperature in degrees Celsius.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub mirror_temperature: Option<f32>,
    /// Bean temperature in degrees Celsius.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub bean_temperature: Option<f32>,
}

impl MeasurementReading {
    /// Create an empty reading.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, field: MeasurementField) -> &mut Option<f32> {
        match field {
            MeasurementField::Moisture => &mut self.moisture,
            MeasurementField::WaterActivity => &mut self.water_activity,
            MeasurementField::Density => &mut self.density,
            MeasurementField::BulkDensity => &mut self.bulk_density,
            MeasurementField::Agtron => &mut self.agtron,
            MeasurementField::Weight => &mut self.weight,
            MeasurementField::ScreenSize => &mut self.screen_size,
            MeasurementField::ScreenDiameter => &mut self.screen_diameter,
            MeasurementField::AmbientTemperature => &mut self.ambient_temperature,
            MeasurementField::Humidity => &mut self.humidity,
            MeasurementField::Pressure => &mut self.pressure,
            MeasurementField::Altitude => &mut self.altitude,
            MeasurementField::MirrorTemperature => &mut self.mirror_temperature,
            MeasurementField::BeanTemperature => &mut self.bean_temperature,
        }
    }

    /// Get the value of a field, if present.
    #[must_use]
    pub fn get(&self, field: MeasurementField) -> Option<f32> {
        match field {
            MeasurementField::Moisture => self.moisture,
            MeasurementField::WaterActivity => self.water_activity,
            MeasurementField::Density => self.density,
            MeasurementField::BulkDensity => self.bulk_density,
            MeasurementField::Agtron => self.agtron,
            MeasurementField::Weight => self.weight,
            MeasurementField::ScreenSize => self.screen_size,
            MeasurementField::ScreenDiameter => self.screen_diameter,
            MeasurementField::AmbientTemperature => self.ambient_temperature,
            MeasurementField::Humidity => self.humidity,
            MeasurementField::Pressure => self.pressure,
            MeasurementField::Altitude => self.altitude,
            MeasurementField::MirrorTemperature => self.mirror_temperature,
            MeasurementField::BeanTemperature => self.bean_temperature,
        }
    }

    /// Set a field value (last write wins).
    pub fn set(&mut self, field: MeasurementField, value: f32) {
        *self.slot(field) = Some(value);
    }

    /// Check whether a field has a value.
    #[must_use]
    pub fn has(&self, field: MeasurementField) -> bool {
        self.get(field).is_some()
    }

    /// Merge another partial reading into this one.
    ///
    /// Fields present in `other` overwrite the corresponding fields here.
    /// Fields absent from `other` are left untouched, so merging never
    /// clears a value. Returns the fields that were written.
    pub fn merge(&mut self, other: &MeasurementReading) -> Vec<MeasurementField> {
        let mut written = Vec::new();
        for field in MeasurementField::ALL {
            if let Some(value) = other.get(field) {
                self.set(field, value);
                written.push(field);
            }
        }
        written
    }

    /// Iterate over the fields that currently have values.
    pub fn present(&self) -> impl Iterator<Item = (MeasurementField, f32)> + '_ {
        MeasurementField::ALL
            .into_iter()
            .filter_map(|f| self.get(f).map(|v| (f, v)))
    }

    /// Number of populated fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.present().count()
    }

    /// Whether no field has a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every field in `fields` has a value.
    #[must_use]
    pub fn has_all(&self, fields: &[MeasurementField]) -> bool {
        fields.iter().all(|f| self.has(*f))
    }
}

/// Identity and status of the connected analyzer.
///
/// Each value is read from its own characteristic and can fail
/// independently, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Serial number.
    pub serial: Option<String>,
    /// Firmware version.
    pub firmware: Option<String>,
    /// Model string.
    pub model: Option<String>,
    /// Main battery level (0-100).
    pub battery: Option<u8>,
}

impl DeviceInfo {
    /// Whether the serial number has been read.
    #[must_use]
    pub fn has_serial(&self) -> bool {
        self.serial.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Fill in any values missing here from `other`.
    ///
    /// Values already present are kept: device info is immutable for the
    /// lifetime of a connection once read.
    pub fn fill_from(&mut self, other: &DeviceInfo) {
        if self.serial.is_none() {
            self.serial.clone_from(&other.serial);
        }
        if self.firmware.is_none() {
            self.firmware.clone_from(&other.firmware);
        }
        if self.model.is_none() {
            self.model.clone_from(&other.model);
        }
        if self.battery.is_none() {
            self.battery = other.battery;
        }
    }
}

/// Top-level connection state.
///
/// Exactly one instance is live per application; it is owned by the
/// connection manager and only read elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", content = "reason", rename_all = "snake_case"))]
pub enum ConnectionState {
    /// Nothing happening.
    #[default]
    Idle,
    /// Scanning for analyzers.
    Scanning,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and ready to measure.
    Connected,
    /// A measurement session is running.
    Measuring,
    /// An unrecoverable fault that must be acknowledged.
    Error(String),
}

impl ConnectionState {
    /// Check whether moving from `self` to `next` is a documented edge.
    ///
    /// ```
    /// use roastlink_types::ConnectionState;
    ///
    /// assert!(ConnectionState::Idle.can_transition_to(&ConnectionState::Scanning));
    /// assert!(ConnectionState::Connected.can_transition_to(&ConnectionState::Measuring));
    /// assert!(!ConnectionState::Idle.can_transition_to(&ConnectionState::Measuring));
    /// ```
    #[must_use]
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (_, Error(_)) => true,
            (Error(_), Idle) => true,
            (Idle, Scanning) => true,
            (Scanning, Idle) => true,
            (Idle | Scanning, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Idle) => true,
            (Connected, Idle) => true,
            (Connected, Measuring) => true,
            (Measuring, Connected) => true,
            (Measuring, Idle) => true,
            _ => false,
        }
    }

    /// Whether a link to the analyzer is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Measuring)
    }

    /// Whether this is the error state.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error(_))
    }

    /// Short label for display and logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Measuring => "measuring",
            ConnectionState::Error(_) => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Kind of backend record a measurement can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LinkKind {
    /// Green coffee inventory lot.
    Inventory,
    /// Roast batch.
    Roast,
}

impl LinkKind {
    /// Name used for `linked_type` in the backend payload.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LinkKind::Inventory => "inventory",
            LinkKind::Roast => "roast",
        }
    }
}

impl FromStr for LinkKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inventory" => Ok(LinkKind::Inventory),
            "roast" => Ok(LinkKind::Roast),
            other => Err(ParseError::UnknownLinkKind(other.to_string())),
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend record a measurement is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinkTarget {
    /// Entity kind.
    pub kind: LinkKind,
    /// Entity id as known to the backend.
    pub id: String,
}

impl LinkTarget {
    /// Create a link target.
    pub fn new(kind: LinkKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Link to an inventory lot.
    pub fn inventory(id: impl Into<String>) -> Self {
        Self::new(LinkKind::Inventory, id)
    }

    /// Link to a roast batch.
    pub fn roast(id: impl Into<String>) -> Self {
        Self::new(LinkKind::Roast, id)
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
