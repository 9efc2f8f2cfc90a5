use log::{debug, error, info};
use thiserror::Error;

use crate::{
    cgroup::{self, Controller, GroupStore},
    launcher::{self, ExitCode, Membership, ProcessLauncher},
    privilege::Privileged,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource group {0} is not initialized")]
    NotInitialized(String),
    #[error(transparent)]
    Group(#[from] cgroup::Error),
    #[error(transparent)]
    Launch(#[from] launcher::Error),
}

impl Error {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Launch(err) => err.exit_code(),
            _ => ExitCode::FAILURE,
        }
    }
}

/// Terminal state of a supervised run.
#[derive(Debug)]
pub enum Outcome {
    /// Preconditions were not met or the child could not be started.
    Failed(Error),
    /// The child ran and exited with this code.
    Exited(ExitCode),
}

impl Outcome {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Outcome::Failed(err) => err.exit_code(),
            Outcome::Exited(code) => *code,
        }
    }
}

#[derive(Debug)]
pub struct Idle;

#[derive(Debug)]
pub struct Ready {
    membership: Membership,
}

/// Launch of one command inside a resource group.
///
/// `Supervisor<Idle>` only becomes `Supervisor<Ready>` after every controller
/// group was found, so a launch without its groups cannot be expressed.
#[derive(Debug)]
pub struct Supervisor<S> {
    name: String,
    state: S,
}

impl Supervisor<Idle> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Idle,
        }
    }

    /// Checks that the cpu and memory groups exist. Only presence is checked;
    /// the configured limits are left to the initializer.
    pub async fn check<G>(self, store: &G) -> Result<Supervisor<Ready>, Error>
    where
        G: GroupStore + ?Sized,
    {
        let Self { name, .. } = self;
        debug!("Checking groups for {}", name);

        let mut membership = Membership::new();
        for &controller in Controller::all() {
            if !store.exists(controller, &name).await? {
                error!("{} group {} does not exist", controller, name);
                return Err(Error::NotInitialized(name));
            }
            membership = membership.join(controller, store.procs_file(controller, &name));
        }

        Ok(Supervisor {
            name,
            state: Ready { membership },
        })
    }
}

impl Supervisor<Ready> {
    pub fn membership(&self) -> &Membership {
        &self.state.membership
    }

    /// Runs `argv` inside the groups once and waits for it to finish.
    pub async fn launch<L>(self, launcher: &L, _: &Privileged, argv: &[String]) -> Result<ExitCode, Error>
    where
        L: ProcessLauncher + ?Sized,
    {
        info!("Launching {:?} in group {}", argv, self.name);
        let code = launcher.exec(argv, &self.state.membership).await?;
        info!("{:?} exited with {}", argv, code.code());
        Ok(code)
    }
}

/// Checks the groups named `name` and runs `argv` inside them.
pub async fn supervise<G, L>(store: &G, launcher: &L, privileged: &Privileged, name: &str, argv: &[String]) -> Outcome
where
    G: GroupStore + ?Sized,
    L: ProcessLauncher + ?Sized,
{
    let ready = match Supervisor::new(name).check(store).await {
        Ok(ready) => ready,
        Err(err) => return Outcome::Failed(err),
    };

    match ready.launch(launcher, privileged, argv).await {
        Ok(code) => Outcome::Exited(code),
        Err(err) => Outcome::Failed(err),
    }
}

/// [`supervise`] reduced to the exit code the caller should terminate with.
/// Failures are logged, with a hint on how to create a missing group.
pub async fn run_supervised<G, L>(
    store: &G,
    launcher: &L,
    privileged: &Privileged,
    name: &str,
    argv: &[String],
) -> ExitCode
where
    G: GroupStore + ?Sized,
    L: ProcessLauncher + ?Sized,
{
    let outcome = supervise(store, launcher, privileged, name, argv).await;
    if let Outcome::Failed(err) = &outcome {
        error!("{}", err);
        if let Error::NotInitialized(name) = err {
            error!("Run `cgsup-init --name {}` first to create it", name);
        }
    }
    outcome.exit_code()
}
