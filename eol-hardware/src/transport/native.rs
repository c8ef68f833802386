//! Native transport: AJINEXTEK AXL vendor library
//!
//! Entry points are resolved once at load. A missing entry point does not
//! abort the load; the capability that needs it reports `Unsupported`.
//! Every return code goes through [`crate::codec::axl::check`].

use crate::codec::axl::{self, HomeResult};
use eol_core::{EolError, Result};
use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, info, warn};

type OpenFn = unsafe extern "system" fn(irq: i32) -> u32;
type BoolFn = unsafe extern "system" fn() -> i32;
type CountFn = unsafe extern "system" fn(count: *mut i32) -> u32;
type AxisFn = unsafe extern "system" fn(axis: i32) -> u32;
type AxisFlagFn = unsafe extern "system" fn(axis: i32, value: u32) -> u32;
type AxisReadFn = unsafe extern "system" fn(axis: i32, value: *mut u32) -> u32;
type AxisPosFn = unsafe extern "system" fn(axis: i32, position: *mut f64) -> u32;
type AxisDecelFn = unsafe extern "system" fn(axis: i32, decel: f64) -> u32;
type MoveFn = unsafe extern "system" fn(axis: i32, pos: f64, vel: f64, accel: f64, decel: f64) -> u32;
type BitWriteFn = unsafe extern "system" fn(module: i32, offset: i32, value: u32) -> u32;
type BitReadFn = unsafe extern "system" fn(module: i32, offset: i32, value: *mut u32) -> u32;

#[derive(Default)]
struct EntryPoints {
    open: Option<OpenFn>,
    close: Option<BoolFn>,
    is_opened: Option<BoolFn>,
    board_count: Option<CountFn>,
    servo_on: Option<AxisFlagFn>,
    servo_alarm: Option<AxisReadFn>,
    move_start_pos: Option<MoveFn>,
    move_stop: Option<AxisDecelFn>,
    move_e_stop: Option<AxisFn>,
    move_s_stop: Option<AxisFn>,
    in_motion: Option<AxisReadFn>,
    act_pos: Option<AxisPosFn>,
    home_start: Option<AxisFn>,
    home_result: Option<AxisReadFn>,
    write_output_bit: Option<BitWriteFn>,
    read_output_bit: Option<BitReadFn>,
    read_input_bit: Option<BitReadFn>,
}

/// Loaded AXL library with its resolved entry points.
///
/// Function pointers stay valid for as long as `_library` is alive; both
/// live and die together in this struct.
pub struct AxlLibrary {
    path: PathBuf,
    entries: EntryPoints,
    missing: Vec<&'static str>,
    _library: Library,
}

macro_rules! resolve {
    ($lib:expr, $missing:expr, $name:literal, $ty:ty) => {{
        // SAFETY: the signature matches the vendor header for this symbol
        match unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) } {
            Ok(symbol) => Some(*symbol),
            Err(_) => {
                $missing.push($name);
                None
            }
        }
    }};
}

impl AxlLibrary {
    /// Load the library and resolve every known entry point
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading AXL library from {}", path.display());

        // SAFETY: loading runs the library's initializers; the vendor
        // library has no load-time side effects beyond its own state.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            EolError::Unsupported(format!("cannot load {}: {}", path.display(), e))
        })?;

        let mut missing = Vec::new();
        let entries = EntryPoints {
            open: resolve!(library, missing, "AxlOpen", OpenFn),
            close: resolve!(library, missing, "AxlClose", BoolFn),
            is_opened: resolve!(library, missing, "AxlIsOpened", BoolFn),
            board_count: resolve!(library, missing, "AxlGetBoardCount", CountFn),
            servo_on: resolve!(library, missing, "AxmSignalServoOn", AxisFlagFn),
            servo_alarm: resolve!(library, missing, "AxmSignalReadServoAlarm", AxisReadFn),
            move_start_pos: resolve!(library, missing, "AxmMoveStartPos", MoveFn),
            move_stop: resolve!(library, missing, "AxmMoveStop", AxisDecelFn),
            move_e_stop: resolve!(library, missing, "AxmMoveEStop", AxisFn),
            move_s_stop: resolve!(library, missing, "AxmMoveSStop", AxisFn),
            in_motion: resolve!(library, missing, "AxmStatusReadInMotion", AxisReadFn),
            act_pos: resolve!(library, missing, "AxmStatusGetActPos", AxisPosFn),
            home_start: resolve!(library, missing, "AxmHomeSetStart", AxisFn),
            home_result: resolve!(library, missing, "AxmHomeGetResult", AxisReadFn),
            write_output_bit: resolve!(library, missing, "AxdoWriteOutportBit", BitWriteFn),
            read_output_bit: resolve!(library, missing, "AxdoReadOutportBit", BitReadFn),
            read_input_bit: resolve!(library, missing, "AxdiReadInportBit", BitReadFn),
        };

        if missing.is_empty() {
            info!("AXL library loaded: {}", path.display());
        } else {
            warn!(
                "AXL library {} loaded in reduced mode, missing: {}",
                path.display(),
                missing.join(", ")
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            missing,
            _library: library,
        })
    }

    /// Load `path` once per process. Motion and DIO boards share one
    /// library instance, so the registry keeps weak references only and
    /// the library unloads with its last driver.
    pub fn shared(path: &Path) -> Result<Arc<Self>> {
        static LOADED: OnceLock<Mutex<HashMap<PathBuf, Weak<AxlLibrary>>>> = OnceLock::new();

        let registry = LOADED.get_or_init(|| Mutex::new(HashMap::new()));
        let mut loaded = registry
            .lock()
            .map_err(|_| EolError::Other("AXL library registry poisoned".to_string()))?;

        if let Some(library) = loaded.get(path).and_then(Weak::upgrade) {
            return Ok(library);
        }
        let library = Arc::new(Self::load(path)?);
        loaded.insert(path.to_path_buf(), Arc::downgrade(&library));
        Ok(library)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry points that were not exported by the loaded library
    pub fn missing(&self) -> &[&'static str] {
        &self.missing
    }

    pub fn supports(&self, name: &str) -> bool {
        !self.missing.iter().any(|m| *m == name)
    }

    /// Open the library (AxlOpen). Already-open is treated as success.
    pub fn open(&self, irq: i32) -> Result<()> {
        let f = require(self.entries.open, "AxlOpen")?;
        // SAFETY: plain value argument
        let code = unsafe { f(irq) };
        if code == axl::AXT_RT_OPEN_ALREADY {
            debug!("AXL library already open");
            return Ok(());
        }
        axl::check(code, "AxlOpen")
    }

    pub fn close(&self) -> Result<()> {
        let f = require(self.entries.close, "AxlClose")?;
        // SAFETY: no arguments
        unsafe { f() };
        Ok(())
    }

    pub fn is_opened(&self) -> Result<bool> {
        let f = require(self.entries.is_opened, "AxlIsOpened")?;
        // SAFETY: no arguments
        Ok(unsafe { f() } != 0)
    }

    pub fn board_count(&self) -> Result<i32> {
        let f = require(self.entries.board_count, "AxlGetBoardCount")?;
        let mut count = 0i32;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(&mut count) }, "AxlGetBoardCount")?;
        Ok(count)
    }

    pub fn servo_on(&self, axis: i32, on: bool) -> Result<()> {
        let f = require(self.entries.servo_on, "AxmSignalServoOn")?;
        // SAFETY: plain value arguments
        axl::check(unsafe { f(axis, on as u32) }, "AxmSignalServoOn")
    }

    pub fn servo_alarm(&self, axis: i32) -> Result<bool> {
        let f = require(self.entries.servo_alarm, "AxmSignalReadServoAlarm")?;
        let mut value = 0u32;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(axis, &mut value) }, "AxmSignalReadServoAlarm")?;
        Ok(value != 0)
    }

    pub fn move_start_pos(&self, axis: i32, pos: f64, vel: f64, accel: f64, decel: f64) -> Result<()> {
        let f = require(self.entries.move_start_pos, "AxmMoveStartPos")?;
        // SAFETY: plain value arguments
        axl::check(unsafe { f(axis, pos, vel, accel, decel) }, "AxmMoveStartPos")
    }

    pub fn move_stop(&self, axis: i32, decel: f64) -> Result<()> {
        let f = require(self.entries.move_stop, "AxmMoveStop")?;
        // SAFETY: plain value arguments
        axl::check(unsafe { f(axis, decel) }, "AxmMoveStop")
    }

    pub fn emergency_stop(&self, axis: i32) -> Result<()> {
        let f = require(self.entries.move_e_stop, "AxmMoveEStop")?;
        // SAFETY: plain value argument
        axl::check(unsafe { f(axis) }, "AxmMoveEStop")
    }

    pub fn slow_stop(&self, axis: i32) -> Result<()> {
        let f = require(self.entries.move_s_stop, "AxmMoveSStop")?;
        // SAFETY: plain value argument
        axl::check(unsafe { f(axis) }, "AxmMoveSStop")
    }

    pub fn in_motion(&self, axis: i32) -> Result<bool> {
        let f = require(self.entries.in_motion, "AxmStatusReadInMotion")?;
        let mut value = 0u32;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(axis, &mut value) }, "AxmStatusReadInMotion")?;
        Ok(value != 0)
    }

    pub fn actual_position(&self, axis: i32) -> Result<f64> {
        let f = require(self.entries.act_pos, "AxmStatusGetActPos")?;
        let mut pos = 0f64;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(axis, &mut pos) }, "AxmStatusGetActPos")?;
        Ok(pos)
    }

    pub fn home_start(&self, axis: i32) -> Result<()> {
        let f = require(self.entries.home_start, "AxmHomeSetStart")?;
        // SAFETY: plain value argument
        axl::check(unsafe { f(axis) }, "AxmHomeSetStart")
    }

    pub fn home_result(&self, axis: i32) -> Result<HomeResult> {
        let f = require(self.entries.home_result, "AxmHomeGetResult")?;
        let mut value = 0u32;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(axis, &mut value) }, "AxmHomeGetResult")?;
        Ok(HomeResult::from_raw(value))
    }

    pub fn write_output(&self, module: i32, offset: i32, high: bool) -> Result<()> {
        let f = require(self.entries.write_output_bit, "AxdoWriteOutportBit")?;
        // SAFETY: plain value arguments
        axl::check(unsafe { f(module, offset, high as u32) }, "AxdoWriteOutportBit")
    }

    pub fn read_output(&self, module: i32, offset: i32) -> Result<bool> {
        let f = require(self.entries.read_output_bit, "AxdoReadOutportBit")?;
        let mut value = 0u32;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(module, offset, &mut value) }, "AxdoReadOutportBit")?;
        Ok(value != 0)
    }

    pub fn read_input(&self, module: i32, offset: i32) -> Result<bool> {
        let f = require(self.entries.read_input_bit, "AxdiReadInportBit")?;
        let mut value = 0u32;
        // SAFETY: out pointer refers to a live local
        axl::check(unsafe { f(module, offset, &mut value) }, "AxdiReadInportBit")?;
        Ok(value != 0)
    }
}

impl std::fmt::Debug for AxlLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxlLibrary")
            .field("path", &self.path)
            .field("missing", &self.missing)
            .finish()
    }
}

fn require<F>(entry: Option<F>, name: &str) -> Result<F> {
    entry.ok_or_else(|| EolError::Unsupported(format!("{} is not exported by the AXL library", name)))
}
