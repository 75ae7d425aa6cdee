//! The health-report log the gateway session polls via `PollHealthReport`
//! (spec §4.8). Kept as a small flat append-only file, matching the
//! legacy firmware's health-report log described in
//! `examples/original_source/src/LBeacon.h` (`HEALTH_REPORT_ERROR_SIGN`);
//! log rotation itself is out of scope (spec §1's Non-goals list log
//! rotation as an external collaborator).

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use crate::{error::Result, gateway::session::HealthReportSource};

/// An append-only health-report log backed by a file on disk.
pub struct HealthLog {
    path: PathBuf,
}

impl HealthLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one line, prefixed with the current wall-clock timestamp.
    pub fn append(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{} {}", crate::clock::now_ms(), line)?;
        Ok(())
    }

    fn read_last_line(path: &Path) -> Option<String> {
        let contents = std::fs::read_to_string(path).ok()?;
        contents.lines().rev().find(|line| !line.trim().is_empty()).map(str::to_string)
    }
}

impl HealthReportSource for HealthLog {
    fn last_line(&self) -> Option<String> {
        Self::read_last_line(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_line_reflects_most_recent_append() {
        let dir = std::env::temp_dir().join(format!("lbeacon-health-{:?}", std::thread::current().id()));
        let log = HealthLog::new(&dir);
        log.append("heartbeat ok").unwrap();
        log.append("ERROR dongle 0 unavailable").unwrap();

        assert!(log.last_line().unwrap().ends_with("ERROR dongle 0 unavailable"));
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn missing_log_file_reports_no_last_line() {
        let log = HealthLog::new("/nonexistent/path/health.log");
        assert!(log.last_line().is_none());
    }
}
