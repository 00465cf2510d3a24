//! Platform-agnostic types for the roastlink coffee analyzer integration.
//!
//! This crate provides the shared data model used by the BLE core
//! (roastlink-core), the offline queue store (roastlink-store) and the CLI.
//!
//! # Features
//!
//! - Sparse measurement readings with explicit optional fields
//! - Coffee type selector and measurement field ids used on the wire
//! - Device information and the connection state machine's states
//! - UUID constants for BLE characteristics
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use roastlink_types::{MeasurementField, MeasurementReading};
//!
//! let mut reading = MeasurementReading::new();
//! reading.set(MeasurementField::Moisture, 11.8);
//! assert_eq!(reading.moisture, Some(11.8));
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    CoffeeType, ConnectionState, DeviceInfo, LinkKind, LinkTarget, MeasurementField,
    MeasurementReading,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;

    // --- CoffeeType tests ---

    #[test]
    fn test_coffee_type_bytes_roundtrip() {
        for ct in CoffeeType::ALL {
            assert_eq!(CoffeeType::try_from(ct.as_byte()), Ok(ct));
        }
    }

    #[test]
    fn test_coffee_type_from_str() {
        assert_eq!("green".parse::<CoffeeType>(), Ok(CoffeeType::Green));
        assert_eq!(" Roasted ".parse::<CoffeeType>(), Ok(CoffeeType::Roasted));
        assert_eq!("AUTO".parse::<CoffeeType>(), Ok(CoffeeType::Auto));
        assert!("decaf".parse::<CoffeeType>().is_err());
    }

    #[test]
    fn test_coffee_type_default_is_auto() {
        assert_eq!(CoffeeType::default(), CoffeeType::Auto);
        assert_eq!(CoffeeType::Auto.to_string(), "auto");
    }

    // --- MeasurementField tests ---

    #[test]
    fn test_field_ids_are_unique_and_contiguous() {
        for (i, field) in MeasurementField::ALL.iter().enumerate() {
            assert_eq!(field.id() as usize, i + 1);
            assert_eq!(MeasurementField::try_from(field.id()), Ok(*field));
        }
        assert_eq!(
            MeasurementField::try_from(0x00),
            Err(ParseError::UnknownField(0x00))
        );
        assert!(MeasurementField::try_from(0x0F).is_err());
    }

    #[test]
    fn test_field_units() {
        assert_eq!(MeasurementField::Moisture.unit(), "%");
        assert_eq!(MeasurementField::Density.unit(), "g/L");
        assert_eq!(MeasurementField::WaterActivity.unit(), "");
        assert_eq!(MeasurementField::BeanTemperature.unit(), "°C");
    }

    #[test]
    fn test_chamber_temperatures() {
        assert!(MeasurementField::MirrorTemperature.is_chamber_temperature());
        assert!(MeasurementField::BeanTemperature.is_chamber_temperature());
        assert!(!MeasurementField::AmbientTemperature.is_chamber_temperature());
    }

    // --- MeasurementReading tests ---

    #[test]
    fn test_reading_set_get() {
        let mut reading = MeasurementReading::new();
        assert!(reading.is_empty());

        reading.set(MeasurementField::Agtron, 54.2);
        assert_eq!(reading.get(MeasurementField::Agtron), Some(54.2));
        assert_eq!(reading.agtron, Some(54.2));
        assert!(reading.has(MeasurementField::Agtron));
        assert!(!reading.has(MeasurementField::Moisture));
        assert_eq!(reading.len(), 1);
    }

    #[test]
    fn test_reading_merge_never_clears() {
        let mut reading = MeasurementReading::new();
        reading.set(MeasurementField::Moisture, 11.8);
        reading.set(MeasurementField::Density, 720.0);

        let mut update = MeasurementReading::new();
        update.set(MeasurementField::Density, 725.0);
        update.set(MeasurementField::BeanTemperature, 23.1);

        let written = reading.merge(&update);
        assert_eq!(
            written,
            vec![MeasurementField::Density, MeasurementField::BeanTemperature]
        );
        assert_eq!(reading.moisture, Some(11.8));
        assert_eq!(reading.density, Some(725.0));
        assert_eq!(reading.bean_temperature, Some(23.1));

        reading.merge(&MeasurementReading::new());
        assert_eq!(reading.len(), 3);
    }

    #[test]
    fn test_reading_has_all() {
        let mut reading = MeasurementReading::new();
        reading.set(MeasurementField::Moisture, 10.0);
        assert!(reading.has_all(&[MeasurementField::Moisture]));
        assert!(!reading.has_all(&[MeasurementField::Moisture, MeasurementField::Agtron]));
        assert!(reading.has_all(&[]));
    }

    #[test]
    fn test_reading_serde_skips_missing_fields() {
        let mut reading = MeasurementReading::new();
        reading.set(MeasurementField::WaterActivity, 0.52);
        let json = serde_json::to_string(&reading).unwrap();
        assert_eq!(json, r#"{"water_activity":0.52}"#);

        let parsed: MeasurementReading = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reading);
    }

    // --- DeviceInfo tests ---

    #[test]
    fn test_device_info_fill_from_keeps_existing() {
        let mut info = DeviceInfo {
            serial: Some("SN-1".to_string()),
            ..Default::default()
        };
        let other = DeviceInfo {
            serial: Some("SN-2".to_string()),
            firmware: Some("2.1.0".to_string()),
            model: None,
            battery: Some(80),
        };
        info.fill_from(&other);
        assert_eq!(info.serial.as_deref(), Some("SN-1"));
        assert_eq!(info.firmware.as_deref(), Some("2.1.0"));
        assert_eq!(info.battery, Some(80));
        assert!(info.has_serial());
    }

    #[test]
    fn test_device_info_empty_serial_is_unknown() {
        let info = DeviceInfo {
            serial: Some(String::new()),
            ..Default::default()
        };
        assert!(!info.has_serial());
    }

    // --- ConnectionState tests ---

    #[test]
    fn test_documented_edges() {
        use ConnectionState::*;

        let edges = [
            (Idle, Scanning),
            (Scanning, Idle),
            (Idle, Connecting),
            (Scanning, Connecting),
            (Connecting, Connected),
            (Connecting, Idle),
            (Connected, Idle),
            (Connected, Measuring),
            (Measuring, Connected),
            (Measuring, Idle),
            (Error("x".into()), Idle),
        ];
        for (from, to) in edges {
            assert!(from.can_transition_to(&to), "{from} -> {to} should be allowed");
        }
    }

    #[test]
    fn test_undocumented_edges_rejected() {
        use ConnectionState::*;

        let edges = [
            (Idle, Connected),
            (Idle, Measuring),
            (Scanning, Measuring),
            (Connecting, Measuring),
            (Connected, Scanning),
            (Connected, Connecting),
            (Measuring, Scanning),
            (Error("x".into()), Connected),
            (Error("x".into()), Scanning),
        ];
        for (from, to) in edges {
            assert!(!from.can_transition_to(&to), "{from} -> {to} should be rejected");
        }
    }

    #[test]
    fn test_any_state_can_fault() {
        use ConnectionState::*;

        for from in [Idle, Scanning, Connecting, Connected, Measuring] {
            assert!(from.can_transition_to(&Error("fault".into())));
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Measuring.to_string(), "measuring");
        assert_eq!(
            ConnectionState::Error("GATT failure".into()).to_string(),
            "error: GATT failure"
        );
        assert!(ConnectionState::Measuring.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    // --- LinkTarget tests ---

    #[test]
    fn test_link_target() {
        let link = LinkTarget::roast("R-1042");
        assert_eq!(link.kind, LinkKind::Roast);
        assert_eq!(link.to_string(), "roast:R-1042");
        assert_eq!("Inventory".parse::<LinkKind>(), Ok(LinkKind::Inventory));
        assert!("batch".parse::<LinkKind>().is_err());
    }
}
