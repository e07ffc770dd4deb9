//! CLI subcommand: `portable paths`
//!
//! Prints the resolved host directories and, when a profile is configured,
//! the per-application session layout.

use anyhow::Result;

use crate::config::{Config, load_profile, locate_profile};
use crate::context::HostEnv;

pub fn run(config: &Config) -> Result<()> {
    let paths = config.paths()?;

    println!("Portable Paths");
    println!("==============");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Home:       {}", paths.home.display());
    println!("Data:       {}", paths.data_home.display());
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }

    let env = HostEnv::from_process();
    let cwd = std::env::current_dir().ok();
    let profile = match locate_profile(&env, cwd.as_deref()) {
        Ok(path) => load_profile(&path, &env)?,
        Err(e) => {
            println!();
            println!("Application: ({})", e);
            return Ok(());
        }
    };
    let app = paths.for_app(&profile.app_id, &profile.state_directory);

    println!();
    println!("Application: {} ({})", profile.friendly_name, profile.app_id);
    println!("  profile:        {}", profile.source.display());
    println!("  sandbox home:   {}", app.sandbox_home().display());
    println!("  user env:       {}", app.user_env_file().display());
    println!("  instance dir:   {}", app.instance_dir().display());
    println!("  control file:   {}", app.control_file().display());
    println!("  control socket: {}", app.control_socket().display());
    println!("  bus socket:     {}", app.bus_socket().display());
    println!("  desktop entry:  {}", app.desktop_entry().display());

    Ok(())
}
