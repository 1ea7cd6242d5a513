//! State lock management: load, save (atomic), path derivation.

use super::error::{InfraError, Result};
use super::types::StateLock;
use std::path::{Path, PathBuf};

/// Directory holding everything recorded for one stack.
pub fn stack_dir(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack)
}

/// Derive the lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    stack_dir(state_dir, stack).join("state.lock.yaml")
}

/// Load the lock file of a stack. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StateLock>> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| InfraError::State(format!("invalid lock file {}: {}", path.display(), e)))?;
    if lock.stack != stack {
        return Err(InfraError::State(format!(
            "lock file {} belongs to stack '{}'",
            path.display(),
            lock.stack
        )));
    }
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<()> {
    let path = lock_file_path(state_dir, &lock.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let yaml = serde_yaml_ng::to_string(lock)?;

    let tmp_path = path.with_extension("lock.yaml.tmp");
    std::fs::write(&tmp_path, &yaml)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        InfraError::State(format!(
            "cannot rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;

    tracing::debug!(path = %path.display(), resources = lock.resources.len(), "lock saved");
    Ok(())
}

/// Create a new empty StateLock for a stack.
pub fn new_lock(project: &str, stack: &str) -> StateLock {
    use crate::tripwire::eventlog::now_iso8601;
    StateLock {
        schema: "1.0".to_string(),
        project: project.to_string(),
        stack: stack.to_string(),
        generated_at: now_iso8601(),
        generator: format!("airtek-infra {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
        outputs: indexmap::IndexMap::new(),
    }
}
