use crate::CoreError;
use hostbridge_runtime::Termination;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What the host knows about a hosted runtime that ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub bundle_id: String,
    pub bundle_version: String,
    /// Signal, exit code, panic message or load failure.
    pub identity: String,
    /// `None` when the runtime never started.
    pub termination: Option<Termination>,
    pub log_tail: Vec<String>,
    pub timestamp: String,
}

impl CrashReport {
    pub fn new(
        bundle_id: &str,
        bundle_version: &str,
        identity: impl Into<String>,
        termination: Option<Termination>,
        log_tail: Vec<String>,
    ) -> Self {
        Self {
            bundle_id: bundle_id.to_owned(),
            bundle_version: bundle_version.to_owned(),
            identity: identity.into(),
            termination,
            log_tail,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Write the report as JSON into `dir`, atomically. Returns the file written.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, CoreError> {
        std::fs::create_dir_all(dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("{}-{stamp}.json", self.bundle_id));
        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| CoreError::Io(e.error))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = CrashReport::new(
            "jre",
            "17.0.8",
            "SIGSEGV (11)",
            Some(Termination::Signaled { signal: 11 }),
            vec!["loading chunk 3".to_owned()],
        );
        let path = report.save(&dir.path().join("crashes")).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("jre-"));
        let back: CrashReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
    }
}
