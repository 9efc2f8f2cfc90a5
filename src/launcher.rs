use async_trait::async_trait;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Write},
    os::unix::{fs::PermissionsExt, process::ExitStatusExt},
    path::{Path, PathBuf},
    process::ExitStatus,
};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    signal::unix::{signal, SignalKind},
};

use crate::cgroup::Controller;

/// Longest decimal representation of a pid (`u32::MAX` has 10 digits).
const PID_BUF: usize = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No command given")]
    EmptyCommand,

    #[error("Failed to open {}: {}", .path.display(), .source)]
    Attach {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to join the resource group: {0}")]
    Join(#[source] io::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

impl Error {
    /// Exit code reported for a launch that never produced a child status,
    /// following the shell conventions for missing and non-executable programs.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Spawn { source, .. } if source.kind() == ErrorKind::NotFound => ExitCode::new(127),
            Error::Spawn { source, .. } if source.kind() == ErrorKind::PermissionDenied => ExitCode::new(126),
            _ => ExitCode::FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn code(&self) -> i32 {
        self.0
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(value: ExitCode) -> Self {
        // The OS keeps only the low byte as well.
        std::process::ExitCode::from(value.0 as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exit(i32),
    Signal(i32),
}

impl ChildStatus {
    /// Signals map to `128 + signo`, as a shell reports them.
    pub fn exit_code(&self) -> ExitCode {
        match *self {
            ChildStatus::Exit(code) => ExitCode::new(code),
            ChildStatus::Signal(signal) => ExitCode::new(128 + signal),
        }
    }
}

impl From<ExitStatus> for ChildStatus {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ChildStatus::Exit(code),
            (None, Some(signal)) => ChildStatus::Signal(signal),
            // Stopped/continued statuses are never returned by wait()
            (None, None) => ChildStatus::Exit(status.into_raw()),
        }
    }
}

/// Groups a launched process is attached to before it starts executing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    procs: Vec<(Controller, PathBuf)>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(mut self, controller: Controller, procs_file: impl Into<PathBuf>) -> Self {
        self.procs.push((controller, procs_file.into()));
        self
    }

    pub fn controllers(&self) -> impl Iterator<Item = Controller> + '_ {
        self.procs.iter().map(|(controller, _)| *controller)
    }

    pub fn procs_files(&self) -> impl Iterator<Item = &Path> {
        self.procs.iter().map(|(_, path)| path.as_path())
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Runs `argv` as a member of every group in `membership` and waits for it.
    async fn exec(&self, argv: &[String], membership: &Membership) -> Result<ExitCode, Error>;
}

/// Launches the target as a child process of the current one.
///
/// Membership files are opened up front; between `fork` and `exec` the child
/// only writes its own pid into them, so the limits hold from the first
/// instruction of the target.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    forward_signals: bool,
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self { forward_signals: true }
    }
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// When enabled, SIGINT, SIGTERM and SIGHUP received by this process while
    /// the child runs are re-sent to the child instead of ending the launcher.
    pub fn forward_signals(mut self, forward: bool) -> Self {
        self.forward_signals = forward;
        self
    }

    fn open_procs(membership: &Membership) -> Result<Vec<File>, Error> {
        membership
            .procs_files()
            .map(|path| {
                OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|source| Error::Attach { path: path.to_owned(), source })
            })
            .collect()
    }
}

/// Termination signals that are relayed to the child while it runs.
struct ForwardedSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl ForwardedSignals {
    fn install() -> Result<Self, Error> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(Error::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(Error::Signal)?,
            hangup: signal(SignalKind::hangup()).map_err(Error::Signal)?,
        })
    }

    async fn wait(mut self, child: &mut Child) -> Result<ExitStatus, Error> {
        let pid = child.id().map(|id| Pid::from_raw(id as i32));

        loop {
            tokio::select! {
                status = child.wait() => return status.map_err(Error::Wait),
                _ = self.interrupt.recv() => forward(pid, Signal::SIGINT),
                _ = self.terminate.recv() => forward(pid, Signal::SIGTERM),
                _ = self.hangup.recv() => forward(pid, Signal::SIGHUP),
            }
        }
    }
}

fn forward(pid: Option<Pid>, sig: Signal) {
    let Some(pid) = pid else { return };
    debug!("Forwarding {} to child {}", sig, pid);
    if let Err(err) = kill(pid, sig) {
        warn!("Failed to forward {} to child {}: {}", sig, pid, err);
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn exec(&self, argv: &[String], membership: &Membership) -> Result<ExitCode, Error> {
        let (program, args) = argv.split_first().ok_or(Error::EmptyCommand)?;
        let procs = Self::open_procs(membership)?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        // Safety: the closure only calls getpid and write(2) on descriptors
        // opened above, both async-signal-safe, and does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                let mut buf = [0u8; PID_BUF];
                let len = format_pid(getpid().as_raw(), &mut buf);
                for mut file in procs.iter() {
                    file.write_all(&buf[..len])?;
                }
                Ok(())
            });
        }

        let status = if self.forward_signals {
            // Installed before the child exists so no signal slips through.
            let signals = ForwardedSignals::install()?;
            let mut child = cmd.spawn().map_err(|source| spawn_error(program, membership, source))?;
            debug!("Started {} as pid {:?}", program, child.id());
            signals.wait(&mut child).await?
        } else {
            cmd.status()
                .await
                .map_err(|source| spawn_error(program, membership, source))?
        };

        let status = ChildStatus::from(status);
        debug!("{} finished with {:?}", program, status);
        Ok(status.exit_code())
    }
}

/// Failures in `pre_exec` and in exec both reach the parent as a bare errno.
/// A denied spawn of a program that is executable can only come from the
/// write to a membership file.
fn spawn_error(program: &str, membership: &Membership, source: io::Error) -> Error {
    if source.kind() == ErrorKind::PermissionDenied && !membership.procs.is_empty() && is_executable(program) {
        return Error::Join(source);
    }
    Error::Spawn {
        program: program.to_string(),
        source,
    }
}

fn is_executable(program: &str) -> bool {
    let runnable = |path: &Path| {
        std::fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if program.contains('/') {
        return runnable(Path::new(program));
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| runnable(&dir.join(program))))
        .unwrap_or(false)
}

/// Writes the decimal form of `pid` to the start of `buf` without allocating.
fn format_pid(pid: i32, buf: &mut [u8; PID_BUF]) -> usize {
    let mut value = pid.unsigned_abs();
    let mut cursor = buf.len();

    loop {
        cursor -= 1;
        buf[cursor] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }

    buf.copy_within(cursor.., 0);
    buf.len() - cursor
}

#[cfg(test)]
mod tests {
    use super::{
        format_pid, spawn_error, ChildStatus, CommandLauncher, Error, ExitCode, Membership, ProcessLauncher, PID_BUF,
    };
    use crate::cgroup::Controller;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn fake_procs(dir: &std::path::Path) -> Membership {
        let cpu = dir.join("cpu.procs");
        let mem = dir.join("memory.procs");
        std::fs::write(&cpu, "").unwrap();
        std::fs::write(&mem, "").unwrap();
        Membership::new().join(Controller::Cpu, cpu).join(Controller::Memory, mem)
    }

    #[test]
    fn given_pids_then_formatted_without_padding() {
        let mut buf = [0u8; PID_BUF];
        let len = format_pid(1, &mut buf);
        assert_eq!(&buf[..len], b"1");
        let len = format_pid(4_194_304, &mut buf);
        assert_eq!(&buf[..len], b"4194304");
        let len = format_pid(i32::MAX, &mut buf);
        assert_eq!(&buf[..len], b"2147483647");
        let len = format_pid(0, &mut buf);
        assert_eq!(&buf[..len], b"0");
    }

    #[test]
    fn given_signal_status_then_exit_code_is_offset() {
        assert_eq!(ChildStatus::Signal(9).exit_code(), ExitCode::new(137));
        assert_eq!(ChildStatus::Exit(3).exit_code(), ExitCode::new(3));
    }

    #[tokio::test]
    async fn given_child_exits_3_then_launcher_returns_3() {
        let dir = tempfile::tempdir().unwrap();
        let membership = fake_procs(dir.path());
        let code = CommandLauncher::new()
            .exec(&sh("exit 3"), &membership)
            .await
            .unwrap();
        assert_eq!(code.code(), 3);
    }

    #[tokio::test]
    async fn given_membership_then_child_pid_written_to_every_procs_file() {
        let dir = tempfile::tempdir().unwrap();
        let membership = fake_procs(dir.path());
        let code = CommandLauncher::new()
            .forward_signals(false)
            .exec(&sh("exit 0"), &membership)
            .await;
        assert_eq!(code.unwrap(), ExitCode::SUCCESS);

        let pids: Vec<String> = membership
            .procs_files()
            .map(|path| std::fs::read_to_string(path).unwrap())
            .collect();
        assert_eq!(pids.len(), 2);
        assert_eq!(pids[0], pids[1]);
        assert!(pids[0].parse::<u32>().unwrap() > 0);
    }

    #[tokio::test]
    async fn given_child_killed_then_exit_code_reflects_signal() {
        let dir = tempfile::tempdir().unwrap();
        let code = CommandLauncher::new()
            .forward_signals(false)
            .exec(&sh("kill -KILL $$"), &fake_procs(dir.path()))
            .await
            .unwrap();
        assert_eq!(code.code(), 128 + 9);
    }

    #[tokio::test]
    async fn given_missing_program_then_spawn_error_maps_to_127() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["/nonexistent/cgsup-target".to_string()];
        let err = CommandLauncher::new()
            .exec(&argv, &fake_procs(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(err.exit_code().code(), 127);
    }

    #[tokio::test]
    async fn given_missing_procs_file_then_attach_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let membership = Membership::new().join(Controller::Cpu, dir.path().join("absent/cgroup.procs"));
        let err = CommandLauncher::new()
            .exec(&sh("exit 0"), &membership)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Attach { .. }));
        assert_eq!(err.exit_code(), ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn given_empty_argv_then_rejected() {
        let err = CommandLauncher::new().exec(&[], &Membership::new()).await.unwrap_err();
        assert!(matches!(err, Error::EmptyCommand));
    }

    #[test]
    fn given_denied_spawn_of_runnable_program_in_group_then_join_error_exit_1() {
        let membership = Membership::new().join(Controller::Cpu, "/cpu/grp/cgroup.procs");
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = spawn_error("sh", &membership, denied);
        assert!(matches!(err, Error::Join(_)));
        assert_eq!(err.exit_code(), ExitCode::FAILURE);
    }

    #[test]
    fn given_denied_spawn_of_non_executable_then_126() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let membership = Membership::new().join(Controller::Cpu, "/cpu/grp/cgroup.procs");
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = spawn_error(script.to_str().unwrap(), &membership, denied);
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(err.exit_code().code(), 126);
    }

    #[test]
    fn given_denied_spawn_without_group_then_126() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = spawn_error("sh", &Membership::new(), denied);
        assert_eq!(err.exit_code().code(), 126);
    }
}
