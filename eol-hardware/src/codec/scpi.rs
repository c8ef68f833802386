//! SCPI command text for the ODA power supply and the WT1800E analyzer

use eol_core::{EolError, Result};

pub const IDN_QUERY: &str = "*IDN?";
pub const CLEAR_STATUS: &str = "*CLS";

/// ODA power supply commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OdaCommand {
    SetVoltage(f64),
    SetCurrent(f64),
    Output(bool),
    MeasureVoltage,
    MeasureCurrent,
    MeasureAll,
}

impl OdaCommand {
    pub fn encode(&self) -> String {
        match *self {
            OdaCommand::SetVoltage(v) => format!("VOLT {:.2}", v),
            OdaCommand::SetCurrent(a) => format!("CURR {:.2}", a),
            OdaCommand::Output(true) => "OUTP ON".to_string(),
            OdaCommand::Output(false) => "OUTP OFF".to_string(),
            OdaCommand::MeasureVoltage => "MEAS:VOLT?".to_string(),
            OdaCommand::MeasureCurrent => "MEAS:CURR?".to_string(),
            OdaCommand::MeasureAll => "MEAS:ALL?".to_string(),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(
            self,
            OdaCommand::MeasureVoltage | OdaCommand::MeasureCurrent | OdaCommand::MeasureAll
        )
    }

    /// Number of values the query answers with
    pub fn response_values(&self) -> usize {
        match self {
            OdaCommand::MeasureAll => 2,
            c if c.is_query() => 1,
            _ => 0,
        }
    }
}

pub const WT_REMOTE_ON: &str = ":COMMunicate:REMote ON";
pub const WT_REMOTE_OFF: &str = ":COMMunicate:REMote OFF";
pub const WT_ERROR_QUERY: &str = ":STATus:ERRor?";

/// WT1800E power analyzer commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WtCommand {
    /// Select voltage, current and active power on the first numeric items
    ConfigureNumeric { element: u8 },
    ReadNumeric,
    /// Older firmware query form
    ReadNumericLegacy,
    IntegrationStart,
    IntegrationStop,
    IntegrationReset,
}

impl WtCommand {
    /// Command lines in the order they go on the wire
    pub fn encode(&self) -> Vec<String> {
        match *self {
            WtCommand::ConfigureNumeric { element } => vec![
                ":NUMeric:FORMat ASCii".to_string(),
                ":NUMeric:NORMal:NUMber 3".to_string(),
                format!(":NUMeric:NORMal:ITEM1 U,{}", element),
                format!(":NUMeric:NORMal:ITEM2 I,{}", element),
                format!(":NUMeric:NORMal:ITEM3 P,{}", element),
            ],
            WtCommand::ReadNumeric => vec![":NUMeric:NORMal:VALue?".to_string()],
            WtCommand::ReadNumericLegacy => vec![":MEASure:NORMal:VALue?".to_string()],
            WtCommand::IntegrationStart => vec![":INTEGrate:STARt".to_string()],
            WtCommand::IntegrationStop => vec![":INTEGrate:STOP".to_string()],
            WtCommand::IntegrationReset => vec![":INTEGrate:RESet".to_string()],
        }
    }
}

/// Parse a comma-separated numeric response, expecting at least `expected`
/// values.
///
/// Instruments report an unavailable value as `NAN`/`INF` or the
/// `9.91E+37` overrange marker; those parse as a protocol error.
pub fn decode_values(text: &str, expected: usize) -> Result<Vec<f64>> {
    let tokens: Vec<&str> = text
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < expected {
        return Err(EolError::UnexpectedTokenCount {
            expected,
            actual: tokens.len(),
        });
    }

    tokens
        .iter()
        .map(|token| {
            let value = token.parse::<f64>().map_err(|_| {
                EolError::Protocol(format!("non-numeric value '{}' in '{}'", token, text.trim()))
            })?;
            if !value.is_finite() || value.abs() >= 9.9e37 {
                return Err(EolError::Protocol(format!(
                    "instrument reported no data ('{}')",
                    token
                )));
            }
            Ok(value)
        })
        .collect()
}

/// Fields of an `*IDN?` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

pub fn decode_identity(text: &str) -> Result<Identity> {
    let parts: Vec<&str> = text.trim().split(',').map(str::trim).collect();
    if parts.len() < 2 || parts[0].is_empty() {
        return Err(EolError::Protocol(format!("malformed identity '{}'", text.trim())));
    }
    let field = |i: usize| parts.get(i).map(|s| s.to_string()).unwrap_or_default();
    Ok(Identity {
        manufacturer: field(0),
        model: field(1),
        serial: field(2),
        firmware: field(3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oda_encoding() {
        assert_eq!(OdaCommand::SetVoltage(24.0).encode(), "VOLT 24.00");
        assert_eq!(OdaCommand::SetCurrent(1.234).encode(), "CURR 1.23");
        assert_eq!(OdaCommand::Output(false).encode(), "OUTP OFF");
        assert_eq!(OdaCommand::MeasureAll.response_values(), 2);
        assert_eq!(OdaCommand::Output(true).response_values(), 0);
    }

    #[test]
    fn test_setpoint_echoes_through_measurement() {
        let cmd = OdaCommand::SetVoltage(24.0).encode();
        let value = cmd.trim_start_matches("VOLT ");
        let parsed = decode_values(value, 1).unwrap();
        assert_eq!(OdaCommand::SetVoltage(parsed[0]).encode(), cmd);
    }

    #[test]
    fn test_wt_configure_selects_element() {
        let lines = WtCommand::ConfigureNumeric { element: 2 }.encode();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[2], ":NUMeric:NORMal:ITEM1 U,2");
    }

    #[test]
    fn test_decode_values() {
        let values = decode_values("2.2012E+02,1.0050E+00,2.2100E+02", 3).unwrap();
        assert_eq!(values.len(), 3);
        assert!((values[0] - 220.12).abs() < 1e-9);
    }

    #[test]
    fn test_decode_values_short_response() {
        let err = decode_values("24.01", 2).unwrap_err();
        assert!(matches!(
            err,
            EolError::UnexpectedTokenCount {
                expected: 2,
                actual: 1
            }
        ));
        assert_eq!(err.class(), eol_core::ErrorClass::Protocol);
    }

    #[test]
    fn test_decode_values_rejects_no_data_markers() {
        assert!(decode_values("NAN,1.0,2.0", 3).is_err());
        assert!(decode_values("9.91E+37", 1).is_err());
        assert!(decode_values("abc", 1).is_err());
    }

    #[test]
    fn test_decode_identity() {
        let id = decode_identity("YOKOGAWA,WT1806E,C2QE12345,F1.01\n").unwrap();
        assert_eq!(id.model, "WT1806E");
        assert_eq!(id.firmware, "F1.01");
        assert!(decode_identity("").is_err());
    }
}
