//! Locating the worker binary.

use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};

use super::error::{BridgeError, BridgeResult};
use crate::config::{expand_env_vars, Settings};

/// File name of the worker binary, without platform suffix.
pub const WORKER_BINARY: &str = "tds-bridge-worker";

fn binary_name() -> String {
    format!("{}{}", WORKER_BINARY, EXE_SUFFIX)
}

/// Resolve the worker executable.
///
/// Search order: `worker.path` from settings, `./tds-bridge-worker`,
/// `./bin/tds-bridge-worker`, next to the current executable, then `PATH`.
pub fn locate_worker(settings: &Settings) -> BridgeResult<PathBuf> {
    if let Some(configured) = &settings.worker.path {
        let path = PathBuf::from(expand_env_vars(configured)?);
        if path.is_file() {
            return Ok(path);
        }
        return Err(BridgeError::Startup(format!(
            "configured worker not found: {}",
            path.display()
        )));
    }

    let name = binary_name();
    let current_dir_candidates = [PathBuf::from(".").join(&name), Path::new("bin").join(&name)];
    if let Some(found) = current_dir_candidates.into_iter().find(|p| p.is_file()) {
        return Ok(found);
    }

    if let Some(sibling) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|p| p.is_file())
    {
        return Ok(sibling);
    }

    which::which(WORKER_BINARY).map_err(|_| {
        BridgeError::Startup(format!(
            "{} not found. Set worker.path in config or put it on PATH",
            WORKER_BINARY
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_configured_path_wins() {
        let dir = TempDir::new().unwrap();
        let worker = dir.path().join("custom-worker");
        std::fs::write(&worker, "").unwrap();

        let mut settings = Settings::default();
        settings.worker.path = Some(worker.to_string_lossy().into_owned());
        assert_eq!(locate_worker(&settings).unwrap(), worker);
    }

    #[test]
    fn test_missing_configured_path_is_startup_error() {
        let mut settings = Settings::default();
        settings.worker.path = Some("/nonexistent/tds-bridge-worker".to_string());
        assert!(matches!(
            locate_worker(&settings),
            Err(BridgeError::Startup(_))
        ));
    }

    #[test]
    fn test_configured_path_expands_env() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("w"), "").unwrap();
        std::env::set_var("TDS_BRIDGE_TEST_WORKER_DIR", dir.path());

        let mut settings = Settings::default();
        settings.worker.path = Some("${TDS_BRIDGE_TEST_WORKER_DIR}/w".to_string());
        assert_eq!(locate_worker(&settings).unwrap(), dir.path().join("w"));

        std::env::remove_var("TDS_BRIDGE_TEST_WORKER_DIR");
    }
}
