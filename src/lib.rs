use thiserror::Error;

pub mod cgroup;
pub mod cli;
pub mod initializer;
pub mod launcher;
pub mod limits;
pub mod lock;
pub mod privilege;
pub mod schema;
#[cfg(any(test, feature = "stub"))]
pub mod stub;
pub mod supervisor;

#[derive(Error, Debug)]
pub enum CgsupError {
    #[error(transparent)]
    Cgroup(#[from] cgroup::Error),
    #[error(transparent)]
    Lock(#[from] lock::Error),
    #[error(transparent)]
    Schema(#[from] rusqlite::Error),
}

pub const DEFAULT_GROUP: &str = "signal_cli_cgroup";
pub const BASE_CG_PATH: &str = "/sys/fs/cgroup";
pub const BASE_LOCK_PATH: &str = "/run/lock";
pub const DEFAULT_DATABASE: &str = "messages.db";

pub const DEFAULT_CPU_QUOTA_US: u64 = 25_000;
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;
pub const DEFAULT_MEMORY_LIMIT: &str = "750M";
