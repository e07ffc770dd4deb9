use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use portable::cli::{self, Cli, Commands};
use portable::config::Config;

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// The helper's output goes to the unit's journal: stderr, no colours.
fn init_helper_logging() {
    let level = std::env::var("PORTABLE_LOGGING").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn run_helper() -> Result<()> {
    init_helper_logging();
    let code = runtime()?.block_on(cli::helper::run());
    std::process::exit(code);
}

fn main() -> Result<()> {
    // argv[0] dispatch: inside the sandbox the binary runs as the helper
    // before clap sees any arguments.
    if let Some(arg0) = std::env::args_os().next()
        && cli::helper::invoked_as_helper(&arg0.to_string_lossy())
    {
        return run_helper();
    }

    let cli = Cli::parse();
    if matches!(cli.command, Some(Commands::Helper)) {
        return run_helper();
    }

    let config = Config::load(cli.config.as_deref());
    let configured = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "warn".to_string());
    let portable_logging = std::env::var("PORTABLE_LOGGING").ok();
    let level = cli::log_level(cli.verbose, portable_logging.as_deref(), &configured).to_string();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)))
        .with_writer(std::io::stderr)
        .init();
    let config = config?;
    let debug = level == "debug";

    let code = runtime()?.block_on(async_main(cli, config, debug))?;
    std::process::exit(code);
}

async fn async_main(cli: Cli, config: Config, debug: bool) -> Result<i32> {
    match cli.command {
        None => cli::run::run(cli.run, &config, debug).await,
        Some(Commands::Run(args)) => cli::run::run(args, &config, debug).await,
        Some(Commands::Stop) => cli::run::stop(&config, debug).await,
        Some(Commands::Policy(args)) => cli::policy::run(args, &config, debug).await.map(|()| 0),
        Some(Commands::Paths) => cli::paths::run(&config).map(|()| 0),
        Some(Commands::Config(args)) => cli::config::run(args, &config).map(|()| 0),
        Some(Commands::Helper) => Ok(cli::helper::run().await),
    }
}
