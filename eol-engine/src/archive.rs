//! JSON archive of finished test runs
//!
//! One pretty-printed file per run under a configured directory, named
//! after the run's start time, sequence and DUT serial so a directory
//! listing sorts chronologically. Files are written to a temporary name
//! and renamed into place, so a reader never sees half a result.

use crate::context::TestResult;
use eol_core::{EolError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Runs sharing a file stem get a numeric suffix, up to this many
const MAX_SUFFIX: u32 = 1000;

/// Directory of archived [`TestResult`]s
#[derive(Debug, Clone)]
pub struct ResultArchive {
    dir: PathBuf,
}

impl ResultArchive {
    /// Open the archive, creating `dir` if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Result archive at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `result` to a new file and return its path. Never overwrites
    /// an earlier run.
    pub fn save(&self, result: &TestResult) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(result)?;
        let stem = file_stem(result);

        for n in 0..MAX_SUFFIX {
            let name = match n {
                0 => format!("{}.json", stem),
                n => format!("{}_{}.json", stem, n),
            };
            let path = self.dir.join(&name);
            let tmp = self.dir.join(format!(".{}.tmp", name));

            // the temp file doubles as the claim on `name`
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&tmp) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            if path.exists() {
                drop(file);
                fs::remove_file(&tmp)?;
                continue;
            }
            file.write_all(&json)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &path)?;

            debug!("Archived {} on {} to {}", result.sequence, result.dut, path.display());
            return Ok(path);
        }

        Err(EolError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("too many archived runs named {}", stem),
        )))
    }

    /// Archived files, oldest first
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn file_stem(result: &TestResult) -> String {
    format!(
        "{}_{}_{}",
        result.started.format("%Y%m%dT%H%M%S%.3fZ"),
        sanitize(&result.sequence),
        sanitize(&result.dut)
    )
}

/// Keep names portable: anything but ASCII alphanumerics, `-` and `.`
/// becomes `_`
fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use eol_core::{TestPhase, Verdict};
    use tempfile::TempDir;

    fn result(dut: &str) -> TestResult {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        TestResult {
            sequence: "force".to_string(),
            dut: dut.to_string(),
            terminal: TestPhase::Completed,
            verdict: Verdict::Pass,
            measurements: vec![],
            phase_timings: vec![],
            error: None,
            cleanup_errors: vec![],
            started,
            finished: started,
        }
    }

    #[test]
    fn test_save_writes_one_json_file_per_run() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path().join("results")).unwrap();

        let first = archive.save(&result("SN-001")).unwrap();
        let second = archive.save(&result("SN-001")).unwrap();

        assert_ne!(first, second);
        assert_eq!(archive.entries().unwrap(), vec![first.clone(), second]);
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            "20260301T083000.000Z_force_SN-001.json"
        );

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&first).unwrap()).unwrap();
        assert_eq!(value["dut"], "SN-001");
        assert_eq!(value["sequence"], "force");
        assert_eq!(value["terminal"], "completed");
    }

    #[test]
    fn test_unsafe_serials_stay_inside_archive() {
        let dir = TempDir::new().unwrap();
        let archive = ResultArchive::open(dir.path()).unwrap();

        let path = archive.save(&result("../../etc/passwd")).unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        assert_eq!(archive.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("SN 12/3"), "SN_12_3");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize(""), "_");
    }
}
