//! Used for stubbing the cgroup filesystem and process launch, so the
//! initializer and supervisor can be driven without root or a real hierarchy.
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    cgroup::{check_name, Controller, Error, GroupStore, PROC_FILE},
    launcher::{self, ExitCode, Membership, ProcessLauncher},
    privilege::Privileged,
};

type Files = HashMap<String, String>;

/// In-memory [`GroupStore`] with failure injection.
#[derive(Debug, Default)]
pub struct MemGroupStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    groups: HashMap<(Controller, String), Files>,
    unmounted: Vec<Controller>,
    read_only: bool,
    failing_file: Option<String>,
    writes: Vec<String>,
}

impl MemGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends the hierarchy of `controller` is not mounted.
    pub fn unmount(self, controller: Controller) -> Self {
        self.lock().unmounted.push(controller);
        self
    }

    /// Creating groups fails with a permission error, writes fail as well.
    pub fn read_only(self) -> Self {
        self.lock().read_only = true;
        self
    }

    /// Every write to a control file called `file` fails.
    pub fn fail_writes_to(self, file: &str) -> Self {
        self.lock().failing_file = Some(file.to_string());
        self
    }

    /// Adds an existing, unconfigured group.
    pub fn with_group(self, controller: Controller, name: &str) -> Self {
        self.lock().groups.entry((controller, name.to_string())).or_default();
        self
    }

    /// Control file writes in the order they happened, as `controller/name/file`.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn file(&self, controller: Controller, name: &str, file: &str) -> Option<String> {
        self.lock()
            .groups
            .get(&(controller, name.to_string()))
            .and_then(|files| files.get(file).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn virtual_path(controller: Controller, name: &str, file: &str) -> String {
        format!("{}/{}/{}", controller, name, file)
    }
}

impl Inner {
    fn mounted(&self, controller: Controller) -> Result<(), Error> {
        if self.unmounted.contains(&controller) {
            Err(Error::Os {
                path: PathBuf::from(controller.as_str()),
                source: io::Error::from(ErrorKind::NotFound),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GroupStore for MemGroupStore {
    async fn exists(&self, controller: Controller, name: &str) -> Result<bool, Error> {
        check_name(name)?;
        let inner = self.lock();
        inner.mounted(controller)?;
        Ok(inner.groups.contains_key(&(controller, name.to_string())))
    }

    async fn create(&self, _: &Privileged, controller: Controller, name: &str) -> Result<(), Error> {
        check_name(name)?;
        let mut inner = self.lock();
        inner.mounted(controller)?;
        if inner.read_only {
            return Err(Error::Permission(format!("cannot create {}/{}", controller, name)));
        }
        inner.groups.entry((controller, name.to_string())).or_default();
        Ok(())
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
        let mut inner = self.lock();
        let path = Self::virtual_path(controller, name, file);
        let failure = |kind: ErrorKind| Error::Configuration {
            file: path.clone(),
            source: io::Error::from(kind),
        };

        if inner.read_only {
            return Err(failure(ErrorKind::PermissionDenied));
        }
        if inner.failing_file.as_deref() == Some(file) {
            return Err(failure(ErrorKind::InvalidInput));
        }

        let files = inner
            .groups
            .get_mut(&(controller, name.to_string()))
            .ok_or_else(|| failure(ErrorKind::NotFound))?;
        files.insert(file.to_string(), value.trim_end().to_string());
        inner.writes.push(path);
        Ok(())
    }

    async fn read(&self, controller: Controller, name: &str, file: &str) -> Result<String, Error> {
        check_name(name)?;
        let inner = self.lock();
        inner.mounted(controller)?;
        inner
            .groups
            .get(&(controller, name.to_string()))
            .and_then(|files| files.get(file).cloned())
            .ok_or_else(|| Error::Os {
                path: PathBuf::from(Self::virtual_path(controller, name, file)),
                source: io::Error::from(ErrorKind::NotFound),
            })
    }

    fn procs_file(&self, controller: Controller, name: &str) -> PathBuf {
        PathBuf::from(Self::virtual_path(controller, name, PROC_FILE))
    }
}

/// A launch seen by [`StubLauncher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub argv: Vec<String>,
    pub controllers: Vec<Controller>,
}

/// [`ProcessLauncher`] that records every call and reports a fixed exit code.
#[derive(Debug)]
pub struct StubLauncher {
    code: ExitCode,
    launches: Mutex<Vec<Launch>>,
}

impl StubLauncher {
    pub fn exiting_with(code: i32) -> Self {
        Self {
            code: ExitCode::new(code),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProcessLauncher for StubLauncher {
    async fn exec(&self, argv: &[String], membership: &Membership) -> Result<ExitCode, launcher::Error> {
        if argv.is_empty() {
            return Err(launcher::Error::EmptyCommand);
        }

        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Launch {
                argv: argv.to_vec(),
                controllers: membership.controllers().collect(),
            });
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemGroupStore, StubLauncher};
    use crate::{
        cgroup::{Controller, Error, GroupStore, CPU_QUOTA},
        launcher::{Membership, ProcessLauncher},
        privilege::Privileged,
    };

    #[tokio::test]
    async fn given_read_only_store_then_create_is_permission_error() {
        let store = MemGroupStore::new().read_only();
        let outcome = store.create(&Privileged::assume(), Controller::Cpu, "grp").await;
        assert!(matches!(outcome, Err(Error::Permission(_))));
    }

    #[tokio::test]
    async fn given_unmounted_controller_then_exists_is_os_error() {
        let store = MemGroupStore::new().unmount(Controller::Memory);
        assert!(matches!(store.exists(Controller::Memory, "grp").await, Err(Error::Os { .. })));
        assert!(!store.exists(Controller::Cpu, "grp").await.unwrap());
    }

    #[tokio::test]
    async fn given_failing_file_then_only_that_write_fails() {
        let store = MemGroupStore::new()
            .with_group(Controller::Cpu, "grp")
            .fail_writes_to(CPU_QUOTA);
        let privileged = Privileged::assume();
        let outcome = store.write(&privileged, Controller::Cpu, "grp", CPU_QUOTA, "1000").await;
        assert!(matches!(outcome, Err(Error::Configuration { .. })));
        store
            .write(&privileged, Controller::Cpu, "grp", "cpu.cfs_period_us", "100000")
            .await
            .unwrap();
        assert_eq!(store.writes(), vec!["cpu/grp/cpu.cfs_period_us".to_string()]);
    }

    #[tokio::test]
    async fn given_launch_then_stub_records_argv_and_controllers() {
        let launcher = StubLauncher::exiting_with(5);
        let membership = Membership::new().join(Controller::Memory, "memory/grp/cgroup.procs");
        let code = launcher.exec(&["true".to_string()], &membership).await.unwrap();
        assert_eq!(code.code(), 5);
        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].argv, vec!["true".to_string()]);
        assert_eq!(launches[0].controllers, vec![Controller::Memory]);
    }
}
