use core::fmt;
use log::debug;
use nix::fcntl::{Flock, FlockArg};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open lock file {}: {}", .path.display(), .source)]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to lock {}: {}", .path.display(), .errno)]
    Lock { path: PathBuf, errno: nix::errno::Errno },
    #[error("{} is held by another initializer", .0.display())]
    Busy(PathBuf),
}

/// Exclusive advisory lock serializing initializers of the same group.
///
/// Released when dropped.
pub struct GroupLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl fmt::Debug for GroupLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupLock").field("path", &self.path).finish()
    }
}

impl GroupLock {
    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("cgsup-{}.lock", name))
    }

    /// Blocks until the lock for `name` is free.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, Error> {
        Self::lock(dir, name, FlockArg::LockExclusive)
    }

    /// Fails with [`Error::Busy`] instead of waiting.
    pub fn try_acquire(dir: &Path, name: &str) -> Result<Self, Error> {
        Self::lock(dir, name, FlockArg::LockExclusiveNonblock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(dir: &Path, name: &str, arg: FlockArg) -> Result<Self, Error> {
        let path = Self::path_for(dir, name);
        // Minimal containers often lack /run/lock
        std::fs::create_dir_all(dir).map_err(|source| Error::Open { path: path.clone(), source })?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| Error::Open { path: path.clone(), source })?;

        let flock = Flock::lock(file, arg).map_err(|(_, errno)| match errno {
            nix::errno::Errno::EWOULDBLOCK => Error::Busy(path.clone()),
            errno => Error::Lock { path: path.clone(), errno },
        })?;

        debug!("Holding {}", path.display());
        Ok(Self { path, _flock: flock })
    }
}
