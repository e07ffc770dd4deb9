use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,
}

pub fn run(args: ConfigArgs, config: &Config) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config, &format),
        ConfigCommands::Path => show_path(config),
    }
}

fn show_config(config: &Config, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        _ => println!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

fn show_path(config: &Config) -> Result<()> {
    let path = config.paths()?.config_file();
    if path.exists() {
        println!("{}", path.display());
    } else {
        println!("{} (not present, using defaults)", path.display());
    }
    Ok(())
}
