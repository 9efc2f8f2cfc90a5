use async_trait::async_trait;
use core::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

use crate::privilege::Privileged;

pub const PROC_FILE: &str = "cgroup.procs";
pub const CPU_QUOTA: &str = "cpu.cfs_quota_us";
pub const CPU_PERIOD: &str = "cpu.cfs_period_us";
pub const MEM_LIMIT: &str = "memory.limit_in_bytes";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Insufficient privilege: {0}")]
    Permission(String),

    #[error("{}: {}", .path.display(), .source)]
    Os {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write control file {file}: {source}")]
    Configuration {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid resource group spec: {0}")]
    InvalidSpec(String),

    #[error("{0:?} is not a valid memory size")]
    InvalidSize(String),

    #[error("{0:?} is not a valid group name")]
    InvalidName(String),
}

/// Subsystems managed by this crate. In the legacy hierarchy every
/// controller is mounted separately, so a group exists once per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    Cpu,
    Memory,
}

impl Controller {
    /// Return list of all supported controllers
    pub const fn all() -> &'static [Controller] {
        &[Controller::Cpu, Controller::Memory]
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::Memory => "memory",
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejects anything that would escape the controller hierarchy.
pub fn check_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Access to the resource-group hierarchy.
///
/// Mutating operations take a [`Privileged`] token so that callers have to
/// decide up front whether they are allowed to touch the hierarchy.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Whether the group directory exists. A missing controller hierarchy is
    /// an error rather than `false`.
    async fn exists(&self, controller: Controller, name: &str) -> Result<bool, Error>;

    /// Creates the group directory. Succeeds if it already exists.
    async fn create(&self, privileged: &Privileged, controller: Controller, name: &str) -> Result<(), Error>;

    async fn write(
        &self,
        privileged: &Privileged,
        controller: Controller,
        name: &str,
        file: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Reads a control file, trailing whitespace removed.
    async fn read(&self, controller: Controller, name: &str, file: &str) -> Result<String, Error>;

    /// Path of the membership file a process id is written to.
    fn procs_file(&self, controller: Controller, name: &str) -> PathBuf;
}

/// [`GroupStore`] backed by the cgroup filesystem, e.g. `/sys/fs/cgroup/cpu/<name>`.
#[derive(Debug, Clone)]
pub struct FsGroupStore {
    root: PathBuf,
}

impl FsGroupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn hierarchy(&self, controller: Controller) -> PathBuf {
        self.root.join(controller.as_str())
    }

    pub fn group_dir(&self, controller: Controller, name: &str) -> PathBuf {
        self.hierarchy(controller).join(name)
    }

    async fn ensure_hierarchy(&self, controller: Controller) -> Result<PathBuf, Error> {
        let hierarchy = self.hierarchy(controller);
        match tokio::fs::metadata(&hierarchy).await {
            Ok(meta) if meta.is_dir() => Ok(hierarchy),
            Ok(_) => Err(Error::Os {
                source: std::io::Error::new(ErrorKind::Other, "controller hierarchy is not a directory"),
                path: hierarchy,
            }),
            Err(source) => Err(Error::Os { path: hierarchy, source }),
        }
    }
}

impl Default for FsGroupStore {
    fn default() -> Self {
        Self::new(crate::BASE_CG_PATH)
    }
}

#[async_trait]
impl GroupStore for FsGroupStore {
    async fn exists(&self, controller: Controller, name: &str) -> Result<bool, Error> {
        check_name(name)?;
        let group_dir = self.ensure_hierarchy(controller).await?.join(name);
        match tokio::fs::metadata(&group_dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(Error::Os { path: group_dir, source }),
        }
    }

    async fn create(&self, _: &Privileged, controller: Controller, name: &str) -> Result<(), Error> {
        check_name(name)?;
        let group_dir = self.ensure_hierarchy(controller).await?.join(name);
        match tokio::fs::create_dir(&group_dir).await {
            Ok(()) => Ok(()),
            // Lost a race with another initializer
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => Err(Error::Permission(format!(
                "cannot create {}: {}",
                group_dir.display(),
                err
            ))),
            Err(source) => Err(Error::Os { path: group_dir, source }),
        }
    }

    async fn write(
        &self,
        _: &Privileged,
        controller: Controller,
        name: &str,
        file: &str,
        value: &str,
    ) -> Result<(), Error> {
        check_name(name)?;
        let path = self.group_dir(controller, name).join(file);
        tokio::fs::write(&path, value)
            .await
            .map_err(|source| Error::Configuration {
                file: path.display().to_string(),
                source,
            })
    }

    async fn read(&self, controller: Controller, name: &str, file: &str) -> Result<String, Error> {
        check_name(name)?;
        let path = self.group_dir(controller, name).join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents.trim_end().to_string()),
            Err(source) => Err(Error::Os { path, source }),
        }
    }

    fn procs_file(&self, controller: Controller, name: &str) -> PathBuf {
        self.group_dir(controller, name).join(PROC_FILE)
    }
}
