//! Coordination service client.
//!
//! The coordinator is an external exclusive file/attribute store used for the
//! server existence lock, the ROOT location pointer, and schema documents.
//! The node only depends on this trait; `FsCoordinator` maps the namespace
//! onto a local directory for single-node deployments and tests.

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Exclusive file/attribute store contract.
pub trait Coordinator: Send + Sync + 'static {
    /// Create a namespace node (and missing parents).
    fn mkdirs(&self, path: &str) -> Result<()>;
    /// Whether a namespace node exists.
    fn exists(&self, path: &str) -> Result<bool>;
    /// Set a named attribute on a node, creating the node if needed.
    fn attr_set(&self, path: &str, name: &str, value: &[u8]) -> Result<()>;
    /// Read a named attribute; absent attribute is an error.
    fn attr_get(&self, path: &str, name: &str) -> Result<Vec<u8>>;
    /// Attempt to take the exclusive lock on a node. Returns whether the
    /// lock was granted; a granted lock is held until `unlock`.
    fn try_lock_exclusive(&self, path: &str) -> Result<bool>;
    /// Release an exclusive lock taken by this process.
    fn unlock(&self, path: &str) -> Result<()>;
}

/// Filesystem-backed coordinator.
pub struct FsCoordinator {
    base: PathBuf,
}

impl FsCoordinator {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn node_dir(&self, path: &str) -> PathBuf {
        let mut dir = self.base.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            dir.push(part);
        }
        dir
    }

    fn attr_path(&self, path: &str, name: &str) -> PathBuf {
        self.node_dir(path).join(format!(".attr.{name}"))
    }

    fn lock_path(&self, path: &str) -> PathBuf {
        self.node_dir(path).join(".lock")
    }
}

impl Coordinator for FsCoordinator {
    fn mkdirs(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.node_dir(path))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.node_dir(path).exists())
    }

    fn attr_set(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        let dir = self.node_dir(path);
        fs::create_dir_all(&dir)?;
        fs::write(self.attr_path(path, name), value)?;
        Ok(())
    }

    fn attr_get(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        fs::read(self.attr_path(path, name)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::Io(format!("attribute '{name}' not found on {path}"))
            } else {
                err.into()
            }
        })
    }

    fn try_lock_exclusive(&self, path: &str) -> Result<bool> {
        let dir = self.node_dir(path);
        fs::create_dir_all(&dir)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(path))
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn unlock(&self, path: &str) -> Result<()> {
        let lock = self.lock_path(path);
        if lock.exists() {
            fs::remove_file(lock)?;
        }
        Ok(())
    }
}

/// Guard holding the server existence lock for the process lifetime.
pub struct ExistenceLock {
    coordinator: std::sync::Arc<dyn Coordinator>,
    path: String,
}

impl ExistenceLock {
    pub fn new(coordinator: std::sync::Arc<dyn Coordinator>, path: String) -> Self {
        Self { coordinator, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for ExistenceLock {
    fn drop(&mut self) {
        if let Err(err) = self.coordinator.unlock(&self.path) {
            tracing::warn!(path = %self.path, error = %err, "failed to release existence lock");
        }
    }
}
