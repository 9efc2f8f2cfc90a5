use clap::Parser;
use log::error;
use std::path::PathBuf;

use cgsup::{
    cgroup::FsGroupStore,
    cli::{init_logging, LogLevel},
    launcher::{CommandLauncher, ExitCode},
    privilege::Privileged,
    supervisor::run_supervised,
    BASE_CG_PATH, DEFAULT_GROUP,
};

#[derive(Parser, Debug)]
#[command(version, about = "Runs a program inside an initialized cpu and memory resource group")]
struct Args {
    /// Name of the group created by cgsup-init.
    #[arg(short, long, env = "CGSUP_GROUP", default_value = DEFAULT_GROUP)]
    name: String,

    #[arg(long, env = "CGSUP_ROOT", default_value = BASE_CG_PATH)]
    root: PathBuf,

    #[arg(long, env = "CGSUP_ASSUME_PRIVILEGED")]
    assume_privileged: bool,

    /// Let SIGINT/SIGTERM/SIGHUP end the launcher instead of relaying them to the program.
    #[arg(long)]
    no_forward_signals: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Program and its arguments, passed through unchanged.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);
    run(args).await.into()
}

async fn run(args: Args) -> ExitCode {
    let privileged = if args.assume_privileged {
        Privileged::assume()
    } else {
        match Privileged::acquire() {
            Ok(privileged) => privileged,
            Err(err) => {
                error!("{}", err);
                return ExitCode::FAILURE;
            }
        }
    };

    let store = FsGroupStore::new(args.root);
    let launcher = CommandLauncher::new().forward_signals(!args.no_forward_signals);

    run_supervised(&store, &launcher, &privileged, &args.name, &args.command).await
}

#[cfg(test)]
mod tests {
    use super::{run, Args};
    use cgsup::{
        cgroup::{Controller, PROC_FILE},
        launcher::ExitCode,
    };
    use clap::Parser;

    fn args(root: &std::path::Path, command: &[&str]) -> Args {
        let mut argv = vec![
            "cgsup-run",
            "--root",
            root.to_str().unwrap(),
            "--assume-privileged",
            "--no-forward-signals",
            "--",
        ];
        argv.extend_from_slice(command);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn given_hyphenated_child_args_then_passed_through() {
        let args = Args::try_parse_from(["cgsup-run", "--", "sh", "-c", "exit 3"]).unwrap();
        assert_eq!(args.command, vec!["sh", "-c", "exit 3"]);
        assert_eq!(args.name, "signal_cli_cgroup");

        let args = Args::try_parse_from(["cgsup-run", "signal-cli", "-a", "+15550100", "jsonRpc"]).unwrap();
        assert_eq!(args.command, vec!["signal-cli", "-a", "+15550100", "jsonRpc"]);
    }

    #[test]
    fn given_no_command_then_parse_fails() {
        assert!(Args::try_parse_from(["cgsup-run"]).is_err());
        assert!(Args::try_parse_from(["cgsup-run", "--name", "grp"]).is_err());
    }

    #[tokio::test]
    async fn given_uninitialized_root_then_exit_1() {
        let root = tempfile::tempdir().unwrap();
        for ctr in Controller::all() {
            std::fs::create_dir(root.path().join(ctr.as_str())).unwrap();
        }
        assert_eq!(run(args(root.path(), &["true"])).await, ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn given_initialized_root_then_child_exit_code_is_returned() {
        let root = tempfile::tempdir().unwrap();
        for ctr in Controller::all() {
            let group = root.path().join(ctr.as_str()).join("signal_cli_cgroup");
            std::fs::create_dir_all(&group).unwrap();
            std::fs::write(group.join(PROC_FILE), b"").unwrap();
        }
        assert_eq!(run(args(root.path(), &["sh", "-c", "exit 3"])).await, ExitCode::new(3));
    }
}
