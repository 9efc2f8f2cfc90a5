use nix::unistd::geteuid;

use crate::cgroup::Error;

/// Proof that the caller may mutate the resource-group hierarchy and attach
/// processes to it.
///
/// Operations that need elevated rights take `&Privileged` instead of
/// escalating on their own.
#[derive(Debug)]
pub struct Privileged {
    _private: (),
}

impl Privileged {
    /// Succeeds only when running with an effective uid of 0.
    pub fn acquire() -> Result<Self, Error> {
        let euid = geteuid();
        if euid.is_root() {
            Ok(Self { _private: () })
        } else {
            Err(Error::Permission(format!(
                "effective uid {} is not root, re-run with sudo",
                euid
            )))
        }
    }

    /// Skips the uid check. For delegated hierarchies owned by the caller, and
    /// for tests working against a scratch directory or an in-memory store.
    pub fn assume() -> Self {
        Self { _private: () }
    }
}
