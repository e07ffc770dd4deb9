//! CLI: `portable [run]` and `portable stop`

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Action, RunArgs, session_context};
use crate::config::Config;
use crate::devices::Udevadm;
use crate::session;

/// Start a session, or stop one for `--actions quit`. Returns the exit code.
pub async fn run(args: RunArgs, config: &Config, debug: bool) -> Result<i32> {
    if args.actions == Some(Action::Quit) {
        return stop(config, debug).await;
    }
    let ctx = session_context(config, args.launch_options(), debug)?;
    info!("Starting {} ({})", ctx.profile.friendly_name, ctx.profile.app_id);
    let resolver = Arc::new(Udevadm::new(ctx.tools.udevadm.clone()));
    let code = session::run(ctx, resolver).await?;
    Ok(code)
}

pub async fn stop(config: &Config, debug: bool) -> Result<i32> {
    let ctx = session_context(config, Default::default(), debug)?;
    let report = session::stop(&ctx).await;
    if report.is_clean() {
        Ok(0)
    } else {
        warn!("Some state could not be cleaned: {:?}", report);
        Ok(1)
    }
}
