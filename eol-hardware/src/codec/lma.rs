//! LMA MCU binary codec
//!
//! Frame layout, both directions: `FF FF | code | len | data[len] | FE FE`.
//! Temperatures travel as integers scaled by [`TEMP_SCALE_FACTOR`].

use super::{CommandFrame, ResponseFrame};
use crate::transport::Framing;
use eol_core::{EolError, Result};

pub const STX: [u8; 2] = [0xFF, 0xFF];
pub const ETX: [u8; 2] = [0xFE, 0xFE];
pub const TEMP_SCALE_FACTOR: f64 = 10.0;
pub const FAN_LEVEL_MIN: u8 = 1;
pub const FAN_LEVEL_MAX: u8 = 10;

/// Stream framing for MCU sessions
pub fn framing() -> Framing {
    Framing::LengthPrefixed {
        start: STX.to_vec(),
        length_offset: 3,
        trailer_len: ETX.len(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum McuCommand {
    EnterTestMode(u32),
    SetUpperTemperature(f64),
    SetFanSpeed(u8),
    /// Standby heating: operating and standby temperature, hold time
    LmaInit {
        operating: f64,
        standby: f64,
        hold_ms: u32,
    },
    SetOperatingTemperature(f64),
    SetCoolingTemperature(f64),
    RequestTemperature,
    StrokeInitComplete,
}

impl McuCommand {
    pub fn code(&self) -> u8 {
        match self {
            McuCommand::EnterTestMode(_) => 0x01,
            McuCommand::SetUpperTemperature(_) => 0x02,
            McuCommand::SetFanSpeed(_) => 0x03,
            McuCommand::LmaInit { .. } => 0x04,
            McuCommand::SetOperatingTemperature(_) => 0x05,
            McuCommand::SetCoolingTemperature(_) => 0x06,
            McuCommand::RequestTemperature => 0x07,
            McuCommand::StrokeInitComplete => 0x08,
        }
    }

    /// Status the MCU answers with once the command is accepted
    pub fn expected_status(&self) -> McuStatus {
        match self {
            McuCommand::EnterTestMode(_) => McuStatus::TestModeComplete,
            McuCommand::SetUpperTemperature(_) => McuStatus::UpperTempOk,
            McuCommand::SetFanSpeed(_) => McuStatus::FanSpeedOk,
            McuCommand::LmaInit { .. } => McuStatus::LmaInitOk,
            McuCommand::SetOperatingTemperature(_) => McuStatus::OperatingTempOk,
            McuCommand::SetCoolingTemperature(_) => McuStatus::CoolingTempOk,
            McuCommand::RequestTemperature => McuStatus::TempResponse,
            McuCommand::StrokeInitComplete => McuStatus::StrokeInitOk,
        }
    }

    /// Notification that follows the acknowledgement once the MCU has
    /// physically reached the commanded state
    pub fn completion(&self) -> Option<McuStatus> {
        match self {
            McuCommand::LmaInit { .. } | McuCommand::SetOperatingTemperature(_) => {
                Some(McuStatus::OperatingTempReached)
            }
            McuCommand::SetCoolingTemperature(_) => Some(McuStatus::CoolingTempReached),
            McuCommand::StrokeInitComplete => Some(McuStatus::StandbyTempReached),
            _ => None,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        Ok(match *self {
            McuCommand::EnterTestMode(mode) => mode.to_be_bytes().to_vec(),
            McuCommand::SetUpperTemperature(t)
            | McuCommand::SetOperatingTemperature(t)
            | McuCommand::SetCoolingTemperature(t) => encode_temperature(t)?.to_vec(),
            McuCommand::SetFanSpeed(level) => {
                if !(FAN_LEVEL_MIN..=FAN_LEVEL_MAX).contains(&level) {
                    return Err(EolError::InvalidInput(format!(
                        "fan level {} out of range {}-{}",
                        level, FAN_LEVEL_MIN, FAN_LEVEL_MAX
                    )));
                }
                vec![level]
            }
            McuCommand::LmaInit {
                operating,
                standby,
                hold_ms,
            } => {
                let mut data = Vec::with_capacity(12);
                data.extend_from_slice(&scaled_u32(operating)?.to_be_bytes());
                data.extend_from_slice(&scaled_u32(standby)?.to_be_bytes());
                data.extend_from_slice(&hold_ms.to_be_bytes());
                data
            }
            McuCommand::RequestTemperature | McuCommand::StrokeInitComplete => Vec::new(),
        })
    }
}

/// Status codes sent by the MCU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuStatus {
    BootComplete,
    TestModeComplete,
    UpperTempOk,
    FanSpeedOk,
    LmaInitOk,
    OperatingTempOk,
    CoolingTempOk,
    TempResponse,
    StrokeInitOk,
    TempRiseStart,
    TempFallStart,
    OperatingTempReached,
    StandbyTempReached,
    CoolingTempReached,
    LmaInitComplete,
}

impl McuStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => McuStatus::BootComplete,
            0x01 => McuStatus::TestModeComplete,
            0x02 => McuStatus::UpperTempOk,
            0x03 => McuStatus::FanSpeedOk,
            0x04 => McuStatus::LmaInitOk,
            0x05 => McuStatus::OperatingTempOk,
            0x06 => McuStatus::CoolingTempOk,
            0x07 => McuStatus::TempResponse,
            0x08 => McuStatus::StrokeInitOk,
            0x09 => McuStatus::TempRiseStart,
            0x0A => McuStatus::TempFallStart,
            0x0B => McuStatus::OperatingTempReached,
            0x0C => McuStatus::StandbyTempReached,
            0x0D => McuStatus::CoolingTempReached,
            0x0E => McuStatus::LmaInitComplete,
            _ => return None,
        })
    }

    pub fn code(&self) -> u8 {
        match self {
            McuStatus::BootComplete => 0x00,
            McuStatus::TestModeComplete => 0x01,
            McuStatus::UpperTempOk => 0x02,
            McuStatus::FanSpeedOk => 0x03,
            McuStatus::LmaInitOk => 0x04,
            McuStatus::OperatingTempOk => 0x05,
            McuStatus::CoolingTempOk => 0x06,
            McuStatus::TempResponse => 0x07,
            McuStatus::StrokeInitOk => 0x08,
            McuStatus::TempRiseStart => 0x09,
            McuStatus::TempFallStart => 0x0A,
            McuStatus::OperatingTempReached => 0x0B,
            McuStatus::StandbyTempReached => 0x0C,
            McuStatus::CoolingTempReached => 0x0D,
            McuStatus::LmaInitComplete => 0x0E,
        }
    }

    /// Unsolicited progress notifications, not command acknowledgements
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            McuStatus::BootComplete
                | McuStatus::TempRiseStart
                | McuStatus::TempFallStart
                | McuStatus::OperatingTempReached
                | McuStatus::StandbyTempReached
                | McuStatus::CoolingTempReached
                | McuStatus::LmaInitComplete
        )
    }
}

/// Raw frame: code plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuFrame {
    pub code: u8,
    pub payload: Vec<u8>,
}

/// Decoded MCU response
#[derive(Debug, Clone, PartialEq)]
pub struct McuResponse {
    pub status: McuStatus,
    pub payload: Vec<u8>,
}

impl McuResponse {
    /// (max, min) temperature from a temperature response
    pub fn temperatures(&self) -> Result<(f64, f64)> {
        if self.status != McuStatus::TempResponse {
            return Err(EolError::Protocol(format!(
                "expected temperature response, got {:?}",
                self.status
            )));
        }
        decode_temperatures(&self.payload)
    }
}

pub fn encode(command: &McuCommand) -> Result<CommandFrame> {
    let frame = McuFrame {
        code: command.code(),
        payload: command.payload()?,
    };
    encode_frame(&frame)
}

pub fn encode_frame(frame: &McuFrame) -> Result<CommandFrame> {
    let len = u8::try_from(frame.payload.len()).map_err(|_| {
        EolError::InvalidInput(format!("payload of {} bytes too long", frame.payload.len()))
    })?;
    let mut bytes = Vec::with_capacity(frame.payload.len() + 6);
    bytes.extend_from_slice(&STX);
    bytes.push(frame.code);
    bytes.push(len);
    bytes.extend_from_slice(&frame.payload);
    bytes.extend_from_slice(&ETX);
    Ok(CommandFrame::new(bytes))
}

pub fn decode_frame(response: &ResponseFrame) -> Result<McuFrame> {
    let bytes = response.as_bytes();
    if bytes.len() < 6 {
        return Err(EolError::Protocol(format!(
            "MCU frame too short: {:02X?}",
            bytes
        )));
    }
    if bytes[..2] != STX {
        return Err(EolError::Protocol(format!("MCU frame bad STX: {:02X?}", bytes)));
    }
    let len = bytes[3] as usize;
    if bytes.len() != len + 6 {
        return Err(EolError::UnexpectedTokenCount {
            expected: len + 6,
            actual: bytes.len(),
        });
    }
    if bytes[len + 4..] != ETX {
        return Err(EolError::Protocol(format!("MCU frame bad ETX: {:02X?}", bytes)));
    }
    Ok(McuFrame {
        code: bytes[2],
        payload: bytes[4..4 + len].to_vec(),
    })
}

pub fn decode(response: &ResponseFrame) -> Result<McuResponse> {
    let frame = decode_frame(response)?;
    let status = McuStatus::from_code(frame.code)
        .ok_or_else(|| EolError::Protocol(format!("unknown MCU status {:#04x}", frame.code)))?;
    Ok(McuResponse {
        status,
        payload: frame.payload,
    })
}

pub fn encode_temperature(celsius: f64) -> Result<[u8; 2]> {
    let scaled = (celsius * TEMP_SCALE_FACTOR).round();
    // NaN fails the range check too
    if !(i16::MIN as f64..=i16::MAX as f64).contains(&scaled) {
        return Err(EolError::InvalidInput(format!(
            "temperature {} °C out of encodable range",
            celsius
        )));
    }
    Ok((scaled as i16).to_be_bytes())
}

fn scaled_u32(celsius: f64) -> Result<u32> {
    let scaled = (celsius * TEMP_SCALE_FACTOR).round();
    if !(0.0..=u32::MAX as f64).contains(&scaled) {
        return Err(EolError::InvalidInput(format!(
            "temperature {} °C out of encodable range",
            celsius
        )));
    }
    Ok(scaled as u32)
}

/// Eight bytes carry (max, min) as big-endian u32; a legacy two-byte
/// payload carries one signed value used for both.
pub fn decode_temperatures(payload: &[u8]) -> Result<(f64, f64)> {
    match payload.len() {
        n if n >= 8 => {
            let max = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let min = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            Ok((
                max as f64 / TEMP_SCALE_FACTOR,
                min as f64 / TEMP_SCALE_FACTOR,
            ))
        }
        n if n >= 2 => {
            let t = i16::from_be_bytes([payload[0], payload[1]]) as f64 / TEMP_SCALE_FACTOR;
            Ok((t, t))
        }
        n => Err(EolError::UnexpectedTokenCount {
            expected: 8,
            actual: n,
        }),
    }
}

/// Map a 0-100 % fan speed onto the MCU's 1-10 levels
pub fn fan_level(percent: f64) -> Result<u8> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(EolError::InvalidInput(format!(
            "fan speed {}% out of range 0-100",
            percent
        )));
    }
    if percent == 0.0 {
        return Ok(FAN_LEVEL_MIN);
    }
    let level = (percent / 100.0 * 9.0) as u8 + 1;
    Ok(level.clamp(FAN_LEVEL_MIN, FAN_LEVEL_MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_operating_temperature() {
        let frame = encode(&McuCommand::SetOperatingTemperature(52.5)).unwrap();
        assert_eq!(
            frame.as_bytes(),
            &[0xFF, 0xFF, 0x05, 0x02, 0x02, 0x0D, 0xFE, 0xFE]
        );
    }

    #[test]
    fn test_non_finite_temperatures_rejected() {
        for celsius in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e9] {
            let err = encode(&McuCommand::SetOperatingTemperature(celsius)).unwrap_err();
            assert!(matches!(err, EolError::InvalidInput(_)), "{}", celsius);
        }
        assert!(encode_temperature(f64::NAN).is_err());
        assert!(encode(&McuCommand::SetCoolingTemperature(f64::NAN)).is_err());
    }

    #[test]
    fn test_encode_test_mode_big_endian() {
        let frame = encode(&McuCommand::EnterTestMode(1)).unwrap();
        assert_eq!(
            frame.as_bytes(),
            &[0xFF, 0xFF, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01, 0xFE, 0xFE]
        );
    }

    #[test]
    fn test_encode_lma_init() {
        let frame = encode(&McuCommand::LmaInit {
            operating: 60.0,
            standby: 40.0,
            hold_ms: 10_000,
        })
        .unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes[3], 12);
        assert_eq!(&bytes[4..8], &600u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &400u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &10_000u32.to_be_bytes());
    }

    #[test]
    fn test_fan_level_mapping() {
        assert_eq!(fan_level(0.0).unwrap(), 1);
        assert_eq!(fan_level(50.0).unwrap(), 5);
        assert_eq!(fan_level(100.0).unwrap(), 10);
        assert!(fan_level(120.0).is_err());
        assert!(encode(&McuCommand::SetFanSpeed(11)).is_err());
    }

    #[test]
    fn test_decode_temperature_response() {
        let mut bytes = vec![0xFF, 0xFF, 0x07, 0x08];
        bytes.extend_from_slice(&523u32.to_be_bytes());
        bytes.extend_from_slice(&251u32.to_be_bytes());
        bytes.extend_from_slice(&ETX);

        let response = decode(&ResponseFrame::new(bytes)).unwrap();
        assert_eq!(response.status, McuStatus::TempResponse);
        let (max, min) = response.temperatures().unwrap();
        assert!((max - 52.3).abs() < 1e-9);
        assert!((min - 25.1).abs() < 1e-9);
    }

    #[test]
    fn test_decode_legacy_two_byte_temperature() {
        let (max, min) = decode_temperatures(&(-55i16).to_be_bytes()).unwrap();
        assert_eq!(max, -5.5);
        assert_eq!(min, -5.5);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let bad_len = ResponseFrame::new(vec![0xFF, 0xFF, 0x03, 0x02, 0x01, 0xFE, 0xFE]);
        assert_eq!(
            decode(&bad_len).unwrap_err().class(),
            eol_core::ErrorClass::Protocol
        );

        let bad_etx = ResponseFrame::new(vec![0xFF, 0xFF, 0x03, 0x00, 0xFE, 0x00]);
        assert!(decode(&bad_etx).is_err());

        let unknown = ResponseFrame::new(vec![0xFF, 0xFF, 0x42, 0x00, 0xFE, 0xFE]);
        assert!(decode(&unknown).is_err());
    }

    #[test]
    fn test_ack_frame_reencodes_identically() {
        let wire = vec![0xFF, 0xFF, 0x03, 0x01, 0x05, 0xFE, 0xFE];
        let frame = decode_frame(&ResponseFrame::new(wire.clone())).unwrap();
        assert_eq!(encode_frame(&frame).unwrap().into_bytes(), wire);
        assert_eq!(
            encode(&McuCommand::SetFanSpeed(5)).unwrap().into_bytes(),
            wire
        );
    }

    #[test]
    fn test_expected_status_pairs() {
        assert_eq!(
            McuCommand::SetFanSpeed(3).expected_status(),
            McuStatus::FanSpeedOk
        );
        assert_eq!(
            McuCommand::SetCoolingTemperature(25.0).expected_status(),
            McuStatus::CoolingTempOk
        );
        assert_eq!(
            McuCommand::LmaInit {
                operating: 60.0,
                standby: 40.0,
                hold_ms: 0
            }
            .completion(),
            Some(McuStatus::OperatingTempReached)
        );
        assert_eq!(McuCommand::SetFanSpeed(3).completion(), None);
        assert!(McuStatus::BootComplete.is_notification());
        assert!(!McuStatus::TempResponse.is_notification());
    }
}
