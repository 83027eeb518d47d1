use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::models::Credential;
use crate::config::AuthConfig;

/// Durable home of the current [`Credential`].
///
/// A store without a path keeps nothing on disk; every process start then
/// begins without a credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: Option<PathBuf>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            path: config.token_file.clone(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the persisted credential.
    ///
    /// A missing, unreadable or corrupt file yields `None`.
    pub fn load(&self) -> Option<Credential> {
        let path = self.path.as_ref()?;
        if !path.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!("Failed to read credential file {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(credential) => {
                log::debug!("Loaded credential from {}", path.display());
                Some(credential)
            }
            Err(e) => {
                log::warn!("Ignoring corrupt credential file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist atomically: write a sibling temp file, then rename over the target.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let tmp_path = temp_path(path);
        let contents = serde_json::to_string_pretty(credential)?;
        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        // 先落盘再 rename，避免掉电后留下空文件
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
        drop(file);
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        log::debug!("Credential saved to {}", path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "credential".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
