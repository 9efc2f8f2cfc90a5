use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use cgsup::{
    cgroup::{check_name, FsGroupStore},
    cli::{init_logging, LogLevel},
    initializer::{self, ResourceGroupState},
    launcher::ExitCode,
    limits::{MemorySize, ResourceGroupSpec},
    lock::GroupLock,
    privilege::Privileged,
    CgsupError, BASE_CG_PATH, BASE_LOCK_PATH, DEFAULT_CPU_PERIOD_US, DEFAULT_CPU_QUOTA_US, DEFAULT_GROUP,
    DEFAULT_MEMORY_LIMIT,
};

#[derive(Parser, Debug)]
#[command(version, about = "Creates a cpu and memory resource group and applies its limits")]
struct Args {
    /// Name of the group in both the cpu and the memory hierarchy.
    #[arg(short, long, env = "CGSUP_GROUP", default_value = DEFAULT_GROUP)]
    name: String,

    /// CPU time in microseconds the group may use per period.
    #[arg(long, default_value_t = DEFAULT_CPU_QUOTA_US)]
    cpu_quota_us: u64,

    #[arg(long, default_value_t = DEFAULT_CPU_PERIOD_US)]
    cpu_period_us: u64,

    /// Memory limit, e.g. "750M" or a plain byte count.
    #[arg(short, long, default_value = DEFAULT_MEMORY_LIMIT)]
    memory_limit: MemorySize,

    /// Mount root of the legacy cgroup hierarchies.
    #[arg(long, env = "CGSUP_ROOT", default_value = BASE_CG_PATH)]
    root: PathBuf,

    /// Directory for the per-group lock file serializing initializers.
    /// Created if missing.
    #[arg(long, env = "CGSUP_LOCK_DIR", default_value = BASE_LOCK_PATH)]
    lock_dir: PathBuf,

    /// Skip the root check, for hierarchies delegated to the current user.
    #[arg(long, env = "CGSUP_ASSUME_PRIVILEGED")]
    assume_privileged: bool,

    /// Only report whether the group exists with these limits; exits 0 if so.
    #[arg(long)]
    check: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);

    let code = match run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    };
    code.into()
}

async fn run(args: Args) -> Result<ExitCode, CgsupError> {
    let spec = ResourceGroupSpec::new(args.name, args.cpu_quota_us, args.cpu_period_us, args.memory_limit);
    let store = FsGroupStore::new(args.root);
    check_name(&spec.name)?;

    if args.check {
        let state = initializer::observe(&store, &spec).await?;
        info!("Group {} is {:?}", spec.name, state);
        if state != ResourceGroupState::Absent {
            if let Ok(limits) = initializer::read_limits(&store, &spec.name).await {
                info!(
                    "cpu quota {}us, period {}us, memory {} bytes",
                    limits.cpu_quota_us, limits.cpu_period_us, limits.memory_limit
                );
            }
        }

        return Ok(if state == ResourceGroupState::Configured {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let privileged = if args.assume_privileged {
        Privileged::assume()
    } else {
        Privileged::acquire()?
    };

    let _lock = GroupLock::acquire(&args.lock_dir, &spec.name)?;
    initializer::ensure_group(&store, &privileged, &spec).await?;

    Ok(ExitCode::SUCCESS)
}
