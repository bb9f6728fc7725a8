// Host storage and permission facility for transfer locations.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::config::StorageConfig;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid file name: '{0}'")]
    InvalidName(String),
    #[error("No such location: {0}")]
    NotFound(String),
    #[error("Location already exists: {0}")]
    Exists(String),
}

/// A writable location plus the external reference handed to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    path: PathBuf,
    uri: String,
}

impl ResourceHandle {
    pub fn new(path: impl Into<PathBuf>, uri: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uri: uri.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    /// The sibling location `file_name` in the same directory.
    pub fn with_file_name(&self, file_name: &str) -> Self {
        let uri = match self.uri.rsplit_once('/') {
            Some((parent, _)) => format!("{}/{}", parent, file_name),
            None => file_name.to_string(),
        };
        Self {
            path: self.path.with_file_name(file_name),
            uri,
        }
    }
}

pub trait StorageProvider: Send + Sync {
    /// Create a new, empty writable file named `file_name`, inside the
    /// directory `scope` when given. Never reuses an existing file.
    fn create_writable(
        &self,
        scope: Option<&str>,
        file_name: &str,
    ) -> Result<ResourceHandle, StorageError>;

    /// Move a location to a new name in the same directory. Grants held on
    /// it follow the file.
    fn rename(&self, handle: &ResourceHandle, file_name: &str)
        -> Result<ResourceHandle, StorageError>;

    fn grant_access(&self, handle: &ResourceHandle, peer: &str) -> Result<(), StorageError>;

    fn revoke_access(&self, handle: &ResourceHandle) -> Result<(), StorageError>;
}

/// Read/write access to one location granted to the peer. Revoked exactly
/// once, when dropped.
pub struct AccessGrant {
    storage: Arc<dyn StorageProvider>,
    handle: ResourceHandle,
}

impl AccessGrant {
    pub fn acquire(
        storage: Arc<dyn StorageProvider>,
        handle: ResourceHandle,
        peer: &str,
    ) -> Result<Self, StorageError> {
        storage.grant_access(&handle, peer)?;
        debug!("[STORAGE] Granted {} to {}", handle.uri(), peer);
        Ok(Self { storage, handle })
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn rename(&mut self, file_name: &str) -> Result<(), StorageError> {
        self.handle = self.storage.rename(&self.handle, file_name)?;
        Ok(())
    }
}

impl Drop for AccessGrant {
    fn drop(&mut self) {
        match self.storage.revoke_access(&self.handle) {
            Ok(()) => debug!("[STORAGE] Revoked {}", self.handle.uri()),
            Err(e) => warn!("[STORAGE] Failed to revoke {}: {}", self.handle.uri(), e),
        }
    }
}

/// Local filesystem storage. Files live under `root/raw_data_dir[/scope]` and
/// are referenced as `content://{authority}/{raw_data_dir}[/scope]/{file}`.
pub struct FileStorage {
    dir: PathBuf,
    authority: String,
    raw_data_dir: String,
    grants: Mutex<HashMap<PathBuf, String>>,
}

impl FileStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dir: config.root.join(&config.raw_data_dir),
            authority: config.authority.clone(),
            raw_data_dir: config.raw_data_dir.clone(),
            grants: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Peer currently holding access to `handle`, if any.
    pub fn grantee(&self, handle: &ResourceHandle) -> Option<String> {
        self.grants().get(handle.path()).cloned()
    }

    fn grants(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, String>> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locate(&self, scope: Option<&str>, file_name: &str) -> Result<ResourceHandle, StorageError> {
        validate_name(file_name)?;
        let (dir, prefix) = match scope {
            Some(scope) => {
                validate_name(scope)?;
                (
                    self.dir.join(scope),
                    format!("{}/{}", self.raw_data_dir, scope),
                )
            }
            None => (self.dir.clone(), self.raw_data_dir.clone()),
        };
        Ok(ResourceHandle::new(
            dir.join(file_name),
            format!("content://{}/{}/{}", self.authority, prefix, file_name),
        ))
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl StorageProvider for FileStorage {
    fn create_writable(
        &self,
        scope: Option<&str>,
        file_name: &str,
    ) -> Result<ResourceHandle, StorageError> {
        let handle = self.locate(scope, file_name)?;
        if let Some(parent) = handle.path().parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(handle.path())
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StorageError::Exists(handle.uri().to_string()),
                _ => StorageError::Io(e),
            })?;
        info!("[STORAGE] Created {}", handle.path().display());
        Ok(handle)
    }

    fn rename(
        &self,
        handle: &ResourceHandle,
        file_name: &str,
    ) -> Result<ResourceHandle, StorageError> {
        validate_name(file_name)?;
        let renamed = handle.with_file_name(file_name);
        if !handle.path().exists() {
            return Err(StorageError::NotFound(handle.uri().to_string()));
        }
        if renamed.path().exists() {
            return Err(StorageError::Exists(renamed.uri().to_string()));
        }
        fs::rename(handle.path(), renamed.path())?;

        let mut grants = self.grants();
        if let Some(peer) = grants.remove(handle.path()) {
            grants.insert(renamed.path().to_path_buf(), peer);
        }
        info!(
            "[STORAGE] Renamed {} to {}",
            handle.file_name(),
            renamed.file_name()
        );
        Ok(renamed)
    }

    fn grant_access(&self, handle: &ResourceHandle, peer: &str) -> Result<(), StorageError> {
        if !handle.path().exists() {
            return Err(StorageError::NotFound(handle.uri().to_string()));
        }
        set_shared(handle.path(), true)?;
        self.grants()
            .insert(handle.path().to_path_buf(), peer.to_string());
        Ok(())
    }

    fn revoke_access(&self, handle: &ResourceHandle) -> Result<(), StorageError> {
        if self.grants().remove(handle.path()).is_none() {
            return Err(StorageError::NotFound(handle.uri().to_string()));
        }
        if handle.path().exists() {
            set_shared(handle.path(), false)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_shared(path: &Path, shared: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    permissions.set_mode(if shared { mode | 0o060 } else { mode & !0o060 });
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn set_shared(_path: &Path, _shared: bool) -> io::Result<()> {
    Ok(())
}
