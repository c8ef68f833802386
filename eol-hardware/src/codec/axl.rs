//! AXL return codes and home-search results
//!
//! Every library call answers with a `u32` return code; [`check`] turns
//! a non-success code into a [`EolError::DeviceFault`] carrying the raw
//! code so operators can look it up in the vendor manual.

use eol_core::{EolError, Result};

pub const AXT_RT_SUCCESS: u32 = 0;
pub const AXT_RT_OPEN_ERROR: u32 = 1001;
pub const AXT_RT_OPEN_ALREADY: u32 = 1002;
pub const AXT_RT_NOT_OPEN: u32 = 1053;
pub const AXT_RT_NOT_SUPPORT_VERSION: u32 = 1054;
pub const AXT_RT_INVALID_PARAMETER: u32 = 1070;
pub const AXT_RT_INVALID_HARDWARE: u32 = 1100;
pub const AXT_RT_INVALID_BOARD_NO: u32 = 1101;
pub const AXT_RT_NETWORK_ERROR: u32 = 1152;
pub const AXT_RT_MOTION_OPEN_ERROR: u32 = 4001;
pub const AXT_RT_MOTION_NOT_MODULE: u32 = 4051;
pub const AXT_RT_MOTION_NOT_INITIAL_AXIS_NO: u32 = 4053;
pub const AXT_RT_MOTION_INVALID_AXIS_NO: u32 = 4101;
pub const AXT_RT_MOTION_INVALID_VELOCITY: u32 = 4113;
pub const AXT_RT_MOTION_ERROR_IN_NONMOTION: u32 = 4151;
pub const AXT_RT_MOTION_ERROR_IN_MOTION: u32 = 4152;
pub const AXT_RT_MOTION_ERROR: u32 = 4153;
pub const AXT_RT_MOTION_MASTER_SERVOON: u32 = 4156;

const RETURN_CODES: &[(u32, &str)] = &[
    (AXT_RT_SUCCESS, "success"),
    (AXT_RT_OPEN_ERROR, "library open failed"),
    (AXT_RT_OPEN_ALREADY, "library already open"),
    (AXT_RT_NOT_OPEN, "library not open"),
    (AXT_RT_NOT_SUPPORT_VERSION, "unsupported hardware version"),
    (AXT_RT_INVALID_PARAMETER, "invalid parameter"),
    (AXT_RT_INVALID_HARDWARE, "invalid hardware"),
    (AXT_RT_INVALID_BOARD_NO, "invalid board number"),
    (AXT_RT_NETWORK_ERROR, "network error"),
    (AXT_RT_MOTION_OPEN_ERROR, "motion module open failed"),
    (AXT_RT_MOTION_NOT_MODULE, "no motion module"),
    (AXT_RT_MOTION_NOT_INITIAL_AXIS_NO, "axis not initialized"),
    (AXT_RT_MOTION_INVALID_AXIS_NO, "invalid axis number"),
    (AXT_RT_MOTION_INVALID_VELOCITY, "invalid velocity"),
    (AXT_RT_MOTION_ERROR_IN_NONMOTION, "error while stopped"),
    (AXT_RT_MOTION_ERROR_IN_MOTION, "error while in motion"),
    (AXT_RT_MOTION_ERROR, "motion error"),
    (AXT_RT_MOTION_MASTER_SERVOON, "master axis servo on"),
];

pub fn describe(code: u32) -> &'static str {
    RETURN_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
        .unwrap_or("unknown return code")
}

/// Map a return code from `entry` to a result
pub fn check(code: u32, entry: &str) -> Result<()> {
    if code == AXT_RT_SUCCESS {
        return Ok(());
    }
    Err(EolError::DeviceFault {
        code: code as i32,
        message: format!("{} failed: {} ({})", entry, describe(code), code),
    })
}

/// Outcome reported by `AxmHomeGetResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeResult {
    Success,
    Searching,
    GantryRange,
    UserBreak,
    Velocity,
    AmpFault,
    NegativeLimit,
    PositiveLimit,
    NotDetected,
    Setting,
    ServoOff,
    Interlock,
    Timeout,
    PositionClear,
    FunctionCall,
    HomeMethod,
    Coupling,
    EmergencyStop,
    Unknown(u32),
}

impl HomeResult {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x01 => HomeResult::Success,
            0x02 => HomeResult::Searching,
            0x10 => HomeResult::GantryRange,
            0x11 => HomeResult::UserBreak,
            0x12 => HomeResult::Velocity,
            0x13 => HomeResult::AmpFault,
            0x14 => HomeResult::NegativeLimit,
            0x15 => HomeResult::PositiveLimit,
            0x16 => HomeResult::NotDetected,
            0x17 => HomeResult::Setting,
            0x18 => HomeResult::ServoOff,
            0x19 => HomeResult::Interlock,
            0x20 => HomeResult::Timeout,
            0x21 => HomeResult::PositionClear,
            0x30 => HomeResult::FunctionCall,
            0x31 => HomeResult::HomeMethod,
            0x40 => HomeResult::Coupling,
            0x41 => HomeResult::EmergencyStop,
            other => HomeResult::Unknown(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            HomeResult::Success => 0x01,
            HomeResult::Searching => 0x02,
            HomeResult::GantryRange => 0x10,
            HomeResult::UserBreak => 0x11,
            HomeResult::Velocity => 0x12,
            HomeResult::AmpFault => 0x13,
            HomeResult::NegativeLimit => 0x14,
            HomeResult::PositiveLimit => 0x15,
            HomeResult::NotDetected => 0x16,
            HomeResult::Setting => 0x17,
            HomeResult::ServoOff => 0x18,
            HomeResult::Interlock => 0x19,
            HomeResult::Timeout => 0x20,
            HomeResult::PositionClear => 0x21,
            HomeResult::FunctionCall => 0x30,
            HomeResult::HomeMethod => 0x31,
            HomeResult::Coupling => 0x40,
            HomeResult::EmergencyStop => 0x41,
            HomeResult::Unknown(raw) => *raw,
        }
    }

    pub fn is_searching(&self) -> bool {
        matches!(self, HomeResult::Searching)
    }

    /// Ok once homed, `None` while still searching, error otherwise
    pub fn into_result(self, axis: i32) -> Option<Result<()>> {
        match self {
            HomeResult::Success => Some(Ok(())),
            HomeResult::Searching => None,
            other => Some(Err(EolError::DeviceFault {
                code: other.raw() as i32,
                message: format!("axis {} homing failed: {:?}", axis, other),
            })),
        }
    }
}
