use log::{debug, info};

use crate::{
    cgroup::{Controller, Error, GroupStore, CPU_PERIOD, CPU_QUOTA, MEM_LIMIT},
    limits::{Limits, ResourceGroupSpec},
    privilege::Privileged,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceGroupState {
    /// At least one of the cpu and memory groups is missing.
    Absent,
    /// Both groups exist but their limits are not known to match.
    Created,
    Configured,
}

/// Makes sure the cpu and memory groups named by `spec` exist and carry its
/// limits. Missing groups are created; the limits are written every time.
///
/// A failed write is reported with the control file that rejected it and
/// leaves earlier writes in place.
pub async fn ensure_group<G>(
    store: &G,
    privileged: &Privileged,
    spec: &ResourceGroupSpec,
) -> Result<ResourceGroupState, Error>
where
    G: GroupStore + ?Sized,
{
    ensure_group_on(store, privileged, spec, num_cpus::get()).await
}

/// [`ensure_group`] for a machine with `cores` CPUs.
pub async fn ensure_group_on<G>(
    store: &G,
    privileged: &Privileged,
    spec: &ResourceGroupSpec,
    cores: usize,
) -> Result<ResourceGroupState, Error>
where
    G: GroupStore + ?Sized,
{
    spec.validate(cores)?;
    let name = spec.name.as_str();

    let mut created = false;
    for &controller in Controller::all() {
        if store.exists(controller, name).await? {
            info!("{} group {} already exists", controller, name);
        } else {
            info!("Creating {} group {}", controller, name);
            store.create(privileged, controller, name).await?;
            created = true;
        }
    }
    if created {
        debug!("Group {}: {:?} -> {:?}", name, ResourceGroupState::Absent, ResourceGroupState::Created);
    }

    let quota = spec.cpu_quota_us.to_string();
    let period = spec.cpu_period_us.to_string();
    let memory = spec.memory_limit.bytes().to_string();
    let writes = [
        (Controller::Cpu, CPU_QUOTA, quota.as_str()),
        (Controller::Cpu, CPU_PERIOD, period.as_str()),
        (Controller::Memory, MEM_LIMIT, memory.as_str()),
    ];

    for (controller, file, value) in writes {
        info!("Setting {}={} on {} group {}", file, value, controller, name);
        store.write(privileged, controller, name, file, value).await?;
    }

    debug!("Group {}: {:?} -> {:?}", name, ResourceGroupState::Created, ResourceGroupState::Configured);
    info!("Group {} configured", name);
    Ok(ResourceGroupState::Configured)
}

/// Reads the limits currently applied to group `name`.
pub async fn read_limits<G>(store: &G, name: &str) -> Result<Limits, Error>
where
    G: GroupStore + ?Sized,
{
    let quota = store.read(Controller::Cpu, name, CPU_QUOTA).await?;
    let period = store.read(Controller::Cpu, name, CPU_PERIOD).await?;
    let memory = store.read(Controller::Memory, name, MEM_LIMIT).await?;

    let malformed =
        |file: &str, value: &str| Error::InvalidSpec(format!("{} holds unexpected value {:?}", file, value));

    Ok(Limits {
        cpu_quota_us: quota.parse().map_err(|_| malformed(CPU_QUOTA, &quota))?,
        cpu_period_us: period.parse().map_err(|_| malformed(CPU_PERIOD, &period))?,
        memory_limit: memory.parse().map_err(|_| malformed(MEM_LIMIT, &memory))?,
    })
}

/// Reports the state of the group named by `spec` without changing anything.
pub async fn observe<G>(store: &G, spec: &ResourceGroupSpec) -> Result<ResourceGroupState, Error>
where
    G: GroupStore + ?Sized,
{
    for &controller in Controller::all() {
        if !store.exists(controller, &spec.name).await? {
            return Ok(ResourceGroupState::Absent);
        }
    }

    match read_limits(store, &spec.name).await {
        Ok(limits) if limits.matches(spec) => Ok(ResourceGroupState::Configured),
        Ok(limits) => {
            debug!("Group {} has {:?}, wanted {:?}", spec.name, limits, spec);
            Ok(ResourceGroupState::Created)
        }
        // Freshly created groups may lack control files in a scratch hierarchy
        Err(Error::Os { .. }) => Ok(ResourceGroupState::Created),
        Err(err) => Err(err),
    }
}
