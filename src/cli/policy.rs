//! CLI: `portable policy`
//!
//! Compiles the sandbox policy for the configured profile and prints it.
//! Nothing is created on the host and no helper process is started.

use anyhow::Result;
use clap::Args;
use serde_json::json;
use std::sync::Arc;

use super::{RunArgs, session_context};
use crate::config::Config;
use crate::devices::Udevadm;
use crate::policy::AssembledPolicy;
use crate::session;

/// Instance id shown in place of a claimed one.
const PLACEHOLDER_INSTANCE_ID: &str = "0000000000";

#[derive(Args, Debug, Clone)]
pub struct PolicyArgs {
    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,

    #[command(flatten)]
    pub run: RunArgs,
}

pub async fn run(args: PolicyArgs, config: &Config, debug: bool) -> Result<()> {
    let ctx = session_context(config, args.run.launch_options(), debug)?
        .with_instance_id(PLACEHOLDER_INSTANCE_ID);
    let resolver = Arc::new(Udevadm::new(ctx.tools.udevadm.clone()));
    let program = ctx.tools.systemd_run.clone();
    let (unit_args, policy) = session::dry_run(ctx, resolver).await?;

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&as_json(&program, &unit_args, &policy))?),
        _ => print_text(&program, &unit_args, &policy),
    }
    Ok(())
}

fn as_json(program: &str, unit_args: &[String], policy: &AssembledPolicy) -> serde_json::Value {
    json!({
        "command": std::iter::once(program).chain(unit_args.iter().map(String::as_str)).collect::<Vec<_>>(),
        "env": policy.env.iter().collect::<Vec<_>>(),
        "busRules": policy.bus_rules.iter().map(|r| r.to_arg()).collect::<Vec<_>>(),
    })
}

fn print_text(program: &str, unit_args: &[String], policy: &AssembledPolicy) {
    println!("Command");
    println!("=======");
    println!("{}", program);
    for arg in unit_args {
        println!("  {}", arg);
    }
    println!();
    println!("Environment");
    println!("===========");
    print!("{}", policy.env.render());
    println!();
    println!("Bus rules");
    println!("=========");
    for rule in &policy.bus_rules {
        println!("{}", rule.to_arg());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOp, BusRule};
    use crate::policy::{DirectiveList, EnvSet};

    #[test]
    fn json_lists_every_section() {
        let mut env = EnvSet::new();
        env.set("HOME", "/home/alice");
        let policy = AssembledPolicy {
            command: DirectiveList::new().terminate(vec!["/usr/lib/portable/helper".into()]),
            env,
            bus_rules: vec![BusRule::new(BusOp::Talk, "org.freedesktop.portal.*")],
        };
        let value = as_json("systemd-run", &["--user".to_string()], &policy);
        assert_eq!(value["command"], json!(["systemd-run", "--user"]));
        assert_eq!(value["env"], json!(["HOME=/home/alice"]));
        assert_eq!(value["busRules"], json!(["--talk=org.freedesktop.portal.*"]));
    }
}
