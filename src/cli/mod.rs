pub mod config;
pub mod helper;
pub mod paths;
pub mod policy;
pub mod run;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{Config, load_profile, locate_profile};
use crate::context::{HostEnv, LaunchOptions, SessionContext};

#[derive(Parser)]
#[command(name = "portable")]
#[command(author, version, about = "Run desktop applications in a sandboxed session")]
#[command(propagate_version = true, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the launcher config file
    #[arg(short, long, global = true, env = "PORTABLE_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the application in a new session (default)
    Run(RunArgs),

    /// Stop the running session and clean up its state
    Stop,

    /// Print the compiled sandbox policy without starting anything
    Policy(policy::PolicyArgs),

    /// Show resolved directory paths
    Paths,

    /// Show the effective launcher configuration
    Config(config::ConfigArgs),

    /// In-sandbox session helper
    #[command(hide = true)]
    Helper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Stop the running session
    Quit,
    /// Start an interactive shell instead of the application
    DebugShell,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Perform an action instead of a plain start
    #[arg(long)]
    pub actions: Option<Action>,

    /// Start the bus activation target
    #[arg(long)]
    pub dbus_activation: bool,

    /// Arguments forwarded to the application
    #[arg(last = true)]
    pub target_args: Vec<String>,
}

impl RunArgs {
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            debug_shell: self.actions == Some(Action::DebugShell),
            bus_activation: self.dbus_activation,
            target_args: self.target_args.clone(),
        }
    }
}

/// Launcher log level when `RUST_LOG` is unset: `-v`, then
/// `PORTABLE_LOGGING`, then the config file.
pub fn log_level<'a>(verbose: bool, portable_logging: Option<&'a str>, configured: &'a str) -> &'a str {
    if verbose {
        return "debug";
    }
    match portable_logging.map(str::trim) {
        Some(level @ ("debug" | "info" | "warn")) => level,
        Some("") | None => configured,
        Some(other) => {
            eprintln!("Unknown PORTABLE_LOGGING value {other:?}, using {configured}");
            configured
        }
    }
}

/// Load the application profile and build the session context.
pub fn session_context(config: &Config, launch: LaunchOptions, debug: bool) -> Result<SessionContext> {
    let env = HostEnv::from_process();
    let cwd = std::env::current_dir().ok();
    let path = locate_profile(&env, cwd.as_deref()).context("Failed to locate application profile")?;
    let profile = load_profile(&path, &env)
        .with_context(|| format!("Failed to load profile {}", path.display()))?;
    let paths = config.paths()?;
    let mut ctx = SessionContext::new(profile, &paths, config, env, launch);
    ctx.verbose = debug;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_precedence() {
        assert_eq!(log_level(true, Some("warn"), "info"), "debug");
        assert_eq!(log_level(false, Some("info"), "warn"), "info");
        assert_eq!(log_level(false, None, "warn"), "warn");
        assert_eq!(log_level(false, Some("loud"), "warn"), "warn");
    }

    #[test]
    fn bare_invocation_runs() {
        let cli = Cli::try_parse_from(["portable"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.actions, None);
    }

    #[test]
    fn actions_and_target_args() {
        let cli = Cli::try_parse_from([
            "portable",
            "--actions",
            "debug-shell",
            "--dbus-activation",
            "--",
            "--new-window",
            "file.txt",
        ])
        .unwrap();
        let launch = cli.run.launch_options();
        assert!(launch.debug_shell);
        assert!(launch.bus_activation);
        assert_eq!(launch.target_args, vec!["--new-window", "file.txt"]);
    }

    #[test]
    fn quit_action_parses() {
        let cli = Cli::try_parse_from(["portable", "--actions", "quit"]).unwrap();
        assert_eq!(cli.run.actions, Some(Action::Quit));
        assert!(!cli.run.launch_options().debug_shell);
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["portable", "-v", "stop"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Some(Commands::Stop)));

        let cli = Cli::try_parse_from(["portable", "run", "--", "a"]).unwrap();
        match cli.command {
            Some(Commands::Run(args)) => assert_eq!(args.target_args, vec!["a"]),
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["portable", "helper"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Helper)));
    }
}
