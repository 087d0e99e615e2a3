//! File inputs: run batches and retry policies as JSON

use std::path::Path;

use anyhow::{Context, Result};
use flakeguard::{RetryPolicy, RunBatch};
use serde::de::DeserializeOwned;

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {} from {}", what, path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing {} in {}", what, path.display()))
}

/// A JSON array of run batches
pub fn load_batches(path: &Path) -> Result<Vec<RunBatch>> {
    read_json(path, "run batches")
}

/// A JSON array of retry policies; missing fields take policy defaults
pub fn load_policies(path: &Path) -> Result<Vec<RetryPolicy>> {
    read_json(path, "retry policies")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_batches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{
                "project_id": "web",
                "branch": "main",
                "build_id": "b-17",
                "outcomes": [{{
                    "identity": {{"project_id": "web", "test_name": "login"}},
                    "status": "failed",
                    "timestamp": "2026-04-01T10:00:00Z",
                    "branch": ""
                }}]
            }}]"#
        )
        .unwrap();

        let batches = load_batches(file.path()).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].build_id.as_deref(), Some("b-17"));
        assert_eq!(batches[0].outcomes.len(), 1);
    }

    #[test]
    fn test_load_policies_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "default", "max_retries": 2}}]"#).unwrap();

        let policies = load_policies(file.path()).unwrap();
        assert_eq!(policies[0].max_retries, 2);
        assert!(policies[0].circuit_breaker.enabled);
    }

    #[test]
    fn test_errors_name_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = load_batches(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing run batches"));
        assert!(load_policies(Path::new("/nonexistent/policies.json")).is_err());
    }
}
