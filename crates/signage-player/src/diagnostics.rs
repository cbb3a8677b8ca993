//! Crash reports for fatal local errors.  The process still terminates; a
//! supervisor is expected to restart it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub message: String,
    pub location: Option<String>,
}

impl CrashReport {
    pub fn new(message: impl Into<String>, location: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            message: message.into(),
            location,
        }
    }

    /// Write the report as `crash-<timestamp>.json` under `dir`.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let name = format!("crash-{}.json", self.timestamp.format("%Y%m%dT%H%M%S%.3fZ"));
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Log `message` and persist a crash report.  Never fails.
pub fn report_fatal(dir: &Path, message: &str, location: Option<String>) {
    error!("fatal: {}", message);
    match CrashReport::new(message, location).write_to(dir) {
        Ok(path) => error!("crash report written to {}", path.display()),
        Err(e) => error!("could not write crash report: {}", e),
    }
}

/// Chain a panic hook that writes a crash report before the default output.
pub fn install_panic_hook(dir: PathBuf) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        report_fatal(&dir, &message, location);
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = CrashReport::new("surface exploded", Some("core.rs:1:1".into()));
        let path = report.write_to(&dir.path().join("crash")).unwrap();

        let back: CrashReport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.message, "surface exploded");
        assert_eq!(back.location.as_deref(), Some("core.rs:1:1"));
    }
}
