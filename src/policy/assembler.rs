//! Concurrent fan-out over the policy producers with a fixed fan-in order.
//!
//! Producers run as independent tasks and are all joined before anything is
//! merged. The merge order is fixed: skeleton, X authority, display, misc,
//! input, camera, GPU, audio, then the exec target. Later fragments rebind
//! destinations masked by earlier ones, so the order must not change.

use std::sync::Arc;
use tracing::{debug, info};

use super::{EnvSet, Fragment, SandboxCommand, audio, display, env, misc, skeleton};
use crate::bus::{self, BusRule};
use crate::context::SessionContext;
use crate::devices::{self, DeviceResolver};
use crate::error::PolicyError;

/// Whether host units (the bus proxy and the audio container) are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Start the helper units and wait for the proxy socket.
    Launch,
    /// Only compute the rules; no side effects on the host.
    DryRun,
}

/// Everything the launcher needs to start the session.
#[derive(Debug, Clone)]
pub struct AssembledPolicy {
    pub command: SandboxCommand,
    pub env: EnvSet,
    pub bus_rules: Vec<BusRule>,
}

/// Run a synchronous producer on the blocking pool.
async fn blocking<F>(
    name: &'static str,
    ctx: &Arc<SessionContext>,
    produce: F,
) -> Result<Fragment, PolicyError>
where
    F: FnOnce(&SessionContext) -> Result<Fragment, PolicyError> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    tokio::task::spawn_blocking(move || produce(&ctx))
        .await
        .map_err(|e| PolicyError::producer(name, e))?
}

async fn bus_policy(ctx: &SessionContext, mode: ProxyMode) -> Result<Vec<BusRule>, PolicyError> {
    let rules = bus::build_rules(
        &ctx.profile.app_id,
        &bus::bus_flags(ctx),
        ctx.profile.mpris_name.as_deref(),
    );
    debug!("Computed {} bus rules", rules.len());
    if mode == ProxyMode::Launch {
        bus::launch_proxy(ctx, &rules).await?;
        bus::wait_for_socket(
            &ctx.paths.bus_socket(),
            ctx.session.proxy_socket_timeout(),
            ctx.session.retry_interval(),
        )
        .await?;
    }
    Ok(rules)
}

/// Command the sandbox executes: the in-sandbox helper.
pub fn exec_target(ctx: &SessionContext) -> Vec<String> {
    vec![ctx.tools.helper.clone()]
}

/// Compile the full policy. The first fatal producer error aborts assembly.
pub async fn assemble(
    ctx: Arc<SessionContext>,
    resolver: Arc<dyn DeviceResolver>,
    mode: ProxyMode,
) -> Result<AssembledPolicy, PolicyError> {
    info!("Assembling sandbox policy for {}", ctx.profile.app_id);

    let input_resolver = Arc::clone(&resolver);
    let gpu_resolver = resolver;
    let (xauth, display, misc, input, camera, gpu, audio, bus_rules) = tokio::try_join!(
        blocking("xauth", &ctx, |c| Ok(display::xauth_fragment(c))),
        blocking("display", &ctx, display::wayland_fragment),
        blocking("misc", &ctx, |c| Ok(misc::misc_fragment(c))),
        blocking("input", &ctx, move |c| Ok(devices::input_fragment(
            c,
            input_resolver.as_ref()
        ))),
        blocking("camera", &ctx, |c| Ok(devices::camera_fragment(c))),
        blocking("gpu", &ctx, move |c| Ok(devices::gpu_fragment(
            c,
            gpu_resolver.as_ref()
        ))),
        async { Ok::<_, PolicyError>(audio::audio_fragment(&ctx, mode).await) },
        bus_policy(&ctx, mode),
    )?;

    let mut directives = skeleton::skeleton(&ctx);
    let mut fragment_env = Vec::new();
    for fragment in [xauth, display, misc, input, camera, gpu, audio] {
        debug!(
            "Fragment {}: {} directive(s), {} env",
            fragment.name,
            fragment.directives.len(),
            fragment.env.len()
        );
        directives.append(fragment.directives);
        fragment_env.extend(fragment.env);
    }
    let command = directives.terminate(exec_target(&ctx));
    let env = env::build_env(&ctx, fragment_env, mode == ProxyMode::Launch);

    Ok(AssembledPolicy {
        command,
        env,
        bus_rules,
    })
}
