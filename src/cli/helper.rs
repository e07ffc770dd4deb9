//! In-sandbox helper entry, reached through `portable helper` or an argv[0]
//! ending in `portable-helper`.

use tracing::error;

use crate::context::HostEnv;
use crate::error::SupervisorError;
use crate::supervisor;

/// Exit code when the main application could not be started.
const EXIT_NOT_STARTED: i32 = 127;

/// Whether the binary was invoked under the helper's name.
pub fn invoked_as_helper(arg0: &str) -> bool {
    let name = std::path::Path::new(arg0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name == "helper" || name.ends_with("portable-helper")
}

pub async fn run() -> i32 {
    match supervisor::run(HostEnv::from_process()).await {
        Ok(code) => code,
        Err(e @ SupervisorError::Spawn { .. }) => {
            error!("{}", e);
            EXIT_NOT_STARTED
        }
        Err(e) => {
            error!("Helper failed: {}", e);
            1
        }
    }
}
