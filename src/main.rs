use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{ArgAction, Args, Parser, Subcommand};
use nix::unistd::getuid;

use selfdock::exit;
use selfdock::{drop_effective, enter, start_forwarding, supervise, InstanceFile, LaunchConfig};

#[derive(Parser, Debug)]
#[command(
    name = "selfdock",
    about = "Run a command in an isolated, disposable view of the host"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command with a read-only root filesystem
    Run(LaunchArgs),
    /// Run a command with a writable root filesystem
    Build(LaunchArgs),
    /// Run a command inside a running instance
    Enter(EnterArgs),
}

#[derive(Args, Debug)]
struct LaunchArgs {
    /// Directory to use as root filesystem
    #[arg(short = 'r', long = "rootfs", value_name = "DIR", default_value = "/")]
    rootfs: PathBuf,

    /// Working directory
    #[arg(short = 'C', value_name = "DIR", default_value = "/")]
    work_dir: PathBuf,

    /// Mount SRC to DST read-only
    #[arg(
        short = 'm',
        long = "map",
        value_names = ["SRC", "DST"],
        num_args = 2,
        action = ArgAction::Append
    )]
    map: Vec<String>,

    /// Mount SRC to DST read-write
    #[arg(
        short = 'v',
        long = "vol",
        value_names = ["SRC", "DST"],
        num_args = 2,
        action = ArgAction::Append
    )]
    vol: Vec<String>,

    /// Mount tmpfs with options OPT at DST
    #[arg(
        short = 't',
        long = "tmpfs",
        value_names = ["OPT", "DST"],
        num_args = 2,
        action = ArgAction::Append
    )]
    tmpfs: Vec<String>,

    /// Set environment variable NAME to VAL
    #[arg(
        short = 'e',
        long = "env",
        value_names = ["NAME", "VAL"],
        num_args = 2,
        action = ArgAction::Append
    )]
    env: Vec<String>,

    /// Unset environment variable NAME
    #[arg(short = 'E', value_name = "NAME", action = ArgAction::Append)]
    env_rm: Vec<String>,

    /// Register the instance under NAME while it runs
    #[arg(short = 'i', long = "instance-name", value_name = "NAME")]
    instance_name: Option<String>,

    /// Command to run inside the container
    #[arg(last = true, required = true, value_name = "argv")]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct EnterArgs {
    /// Instance to enter
    #[arg(short = 'i', long = "instance-name", value_name = "NAME")]
    instance_name: String,

    /// Working directory
    #[arg(short = 'C', value_name = "DIR", default_value = "/")]
    work_dir: PathBuf,

    /// Command to run inside the instance
    #[arg(last = true, required = true, value_name = "argv")]
    command: Vec<String>,
}

fn main() -> ExitCode {
    ExitCode::from(run() as u8)
}

fn run() -> i32 {
    // The binary is installed suid root; become the invoker until a step
    // genuinely needs the granted uid.
    if let Err(err) = drop_effective() {
        eprintln!("{err}");
        return exit::CANNOT;
    }
    let cli = match Cli::try_parse() {
        Ok(v) => v,
        Err(err) => {
            let status = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => exit::CANNOT,
            };
            let _ = err.print();
            return status;
        }
    };
    match cli.command {
        Command::Run(args) => launch(args, false),
        Command::Build(args) => launch(args, true),
        Command::Enter(args) => enter(&args.instance_name, &args.work_dir, &args.command),
    }
}

fn launch(args: LaunchArgs, permit_writable: bool) -> i32 {
    // The environment is the channel into the child; nothing else reads it
    // between here and the exec.
    for pair in args.env.chunks_exact(2) {
        std::env::set_var(&pair[0], &pair[1]);
    }
    for name in &args.env_rm {
        std::env::remove_var(name);
    }

    let mut options = LaunchConfig::options()
        .rootfs(args.rootfs)
        .work_dir(args.work_dir)
        .permit_writable(permit_writable)
        .command(args.command);
    for pair in args.map.chunks_exact(2) {
        options = options.map(&pair[0], &pair[1]);
    }
    for pair in args.vol.chunks_exact(2) {
        options = options.vol(&pair[0], &pair[1]);
    }
    for pair in args.tmpfs.chunks_exact(2) {
        options = options.tmpfs(&pair[0], &pair[1]);
    }
    let config = match options.create() {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err}");
            return exit::CANNOT;
        }
    };

    if let Err(err) = start_forwarding() {
        eprintln!("{err}");
        return exit::CANNOT;
    }

    let instance = match &args.instance_name {
        Some(name) => match InstanceFile::create(name, getuid()) {
            Ok(v) => Some(v),
            Err(err) => {
                eprintln!("{err}");
                return err.exit_status();
            }
        },
        None => None,
    };
    supervise(&config, instance)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run() {
        let cli = Cli::try_parse_from([
            "selfdock", "run", "-r", "/srv/root", "-m", "/etc", "/etc", "-m", "/usr", "/usr",
            "--", "/bin/sh", "-c", "true",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.rootfs, PathBuf::from("/srv/root"));
                assert_eq!(args.map, ["/etc", "/etc", "/usr", "/usr"]);
                assert!(args.vol.is_empty());
                assert_eq!(args.command, ["/bin/sh", "-c", "true"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_enter() {
        let cli = Cli::try_parse_from(["selfdock", "enter", "-i", "demo", "--", "true"]).unwrap();
        match cli.command {
            Command::Enter(args) => {
                assert_eq!(args.instance_name, "demo");
                assert_eq!(args.work_dir, PathBuf::from("/"));
                assert_eq!(args.command, ["true"]);
            }
            _ => panic!("expected enter"),
        }
    }

    #[test]
    fn missing_command_is_rejected() {
        assert!(Cli::try_parse_from(["selfdock", "run", "-r", "/"]).is_err());
    }
}
