//! BS205 load cell indicator codec
//!
//! Commands are two bytes: `0x30 + indicator id` followed by an ASCII
//! command letter. Only the weight read answers, with a fixed 10-byte
//! frame: `STX | id | sign | value (7 ASCII, spaces allowed) | ETX`.

use super::{CommandFrame, ResponseFrame};
use eol_core::{EolError, Reading, Result, Unit};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
/// Length of a weight response frame
pub const FRAME_LEN: usize = 10;
/// Highest indicator id addressable with one byte (`0x3F`)
pub const MAX_INDICATOR_ID: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bs205Command {
    ReadWeight,
    Zero,
    Hold,
    HoldRelease,
}

impl Bs205Command {
    pub fn code(&self) -> u8 {
        match self {
            Bs205Command::ReadWeight => b'R',
            Bs205Command::Zero => b'Z',
            Bs205Command::Hold => b'H',
            Bs205Command::HoldRelease => b'L',
        }
    }

    /// The indicator acknowledges nothing but weight reads
    pub fn expects_response(&self) -> bool {
        matches!(self, Bs205Command::ReadWeight)
    }
}

/// Decoded weight response
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightFrame {
    pub indicator_id: u8,
    pub reading: Reading,
}

pub fn encode(indicator_id: u8, command: Bs205Command) -> Result<CommandFrame> {
    if indicator_id > MAX_INDICATOR_ID {
        return Err(EolError::InvalidInput(format!(
            "indicator id {} out of range 0-{}",
            indicator_id, MAX_INDICATOR_ID
        )));
    }
    Ok(CommandFrame::new(vec![0x30 + indicator_id, command.code()]))
}

pub fn decode(frame: &ResponseFrame) -> Result<WeightFrame> {
    let bytes = frame.as_bytes();
    let start = bytes
        .iter()
        .position(|&b| b == STX)
        .ok_or_else(|| EolError::Protocol(format!("BS205 frame without STX: {:02X?}", bytes)))?;
    let end = bytes[start..]
        .iter()
        .position(|&b| b == ETX)
        .map(|p| p + start)
        .ok_or_else(|| EolError::Protocol(format!("BS205 frame without ETX: {:02X?}", bytes)))?;

    let data = &bytes[start + 1..end];
    if data.len() != FRAME_LEN - 2 {
        return Err(EolError::UnexpectedTokenCount {
            expected: FRAME_LEN - 2,
            actual: data.len(),
        });
    }

    let indicator_id = match data[0] {
        b @ 0x30..=0x3F => b - 0x30,
        other => {
            return Err(EolError::Protocol(format!(
                "BS205 invalid indicator byte {:#04x}",
                other
            )))
        }
    };

    let negative = match data[1] {
        b'+' => false,
        b'-' => true,
        other => {
            return Err(EolError::Protocol(format!(
                "BS205 missing sign, got {:#04x}",
                other
            )))
        }
    };

    let (value, precision) = parse_value(&data[2..])?;
    let value = if negative { -value } else { value };

    Ok(WeightFrame {
        indicator_id,
        reading: Reading::new(value, Unit::KilogramForce, precision),
    })
}

/// Parse the 7-byte value field. Spaces (or `_`) pad the digits; a missing
/// integer part (".487") reads as zero.
fn parse_value(field: &[u8]) -> Result<(f64, u8)> {
    let mut text: String = field
        .iter()
        .filter(|&&b| b != b' ' && b != b'_')
        .map(|&b| b as char)
        .collect();

    let dots = text.chars().filter(|&c| c == '.').count();
    if text.is_empty() || dots > 1 || !text.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(EolError::Protocol(format!(
            "BS205 malformed value field {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    if text.starts_with('.') {
        text.insert(0, '0');
    }

    let precision = text
        .split_once('.')
        .map(|(_, frac)| frac.len() as u8)
        .unwrap_or(0);
    let value = text
        .parse::<f64>()
        .map_err(|e| EolError::Protocol(format!("BS205 value {:?}: {}", text, e)))?;
    Ok((value, precision))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> ResponseFrame {
        let mut bytes = vec![STX];
        bytes.extend_from_slice(payload);
        bytes.push(ETX);
        ResponseFrame::new(bytes)
    }

    #[test]
    fn test_encode_read_weight() {
        let cmd = encode(1, Bs205Command::ReadWeight).unwrap();
        assert_eq!(cmd.as_bytes(), &[0x31, 0x52]);
        assert_eq!(encode(5, Bs205Command::Zero).unwrap().as_bytes(), &[0x35, b'Z']);
    }

    #[test]
    fn test_encode_rejects_large_id() {
        assert!(encode(16, Bs205Command::ReadWeight).is_err());
    }

    #[test]
    fn test_decode_padded_value() {
        let w = decode(&frame(b"1+ 7.487")).unwrap();
        assert_eq!(w.indicator_id, 1);
        assert!((w.reading.value - 7.487).abs() < 1e-9);
        assert_eq!(w.reading.precision, 3);
        assert_eq!(w.reading.unit, Unit::KilogramForce);
    }

    #[test]
    fn test_decode_negative_and_leading_dot() {
        let w = decode(&frame(b"0-  .250")).unwrap();
        assert!((w.reading.value + 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_decode_without_decimal_point() {
        let w = decode(&frame(b"1+  7487")).unwrap();
        assert_eq!(w.reading.value, 7487.0);
        assert_eq!(w.reading.precision, 0);
    }

    #[test]
    fn test_decode_id_above_nine() {
        let w = decode(&frame(b"?+1.7486")).unwrap();
        assert_eq!(w.indicator_id, 15);
    }

    #[test]
    fn test_decode_skips_leading_noise() {
        let mut bytes = vec![0xFF, 0x00];
        bytes.extend_from_slice(frame(b"1+ 2.500").as_bytes());
        let w = decode(&ResponseFrame::new(bytes)).unwrap();
        assert!((w.reading.value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_errors_are_protocol() {
        let short = decode(&frame(b"1+2.5")).unwrap_err();
        assert_eq!(short.class(), eol_core::ErrorClass::Protocol);

        let no_sign = decode(&frame(b"1 02.500")).unwrap_err();
        assert_eq!(no_sign.class(), eol_core::ErrorClass::Protocol);

        let garbage = decode(&frame(b"1+2.5x00")).unwrap_err();
        assert_eq!(garbage.class(), eol_core::ErrorClass::Protocol);

        let no_etx = decode(&ResponseFrame::new(vec![STX, b'1', b'+'])).unwrap_err();
        assert_eq!(no_etx.class(), eol_core::ErrorClass::Protocol);
    }

    #[test]
    fn test_response_addresses_the_same_command() {
        let request = encode(3, Bs205Command::ReadWeight).unwrap();
        let response = decode(&frame(b"3+ 1.000")).unwrap();
        assert_eq!(
            encode(response.indicator_id, Bs205Command::ReadWeight).unwrap(),
            request
        );
    }
}
