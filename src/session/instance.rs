//! Instance id allocation and the persisted control record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::context::SessionContext;
use crate::error::SessionError;

/// Upper bound (exclusive) of random instance ids.
const INSTANCE_ID_RANGE: u64 = 9_999_999_999;

pub fn random_candidate() -> String {
    use rand::RngExt;
    rand::rng().random_range(0..INSTANCE_ID_RANGE).to_string()
}

/// Claim an id by atomically creating `<root>/<id>`.
///
/// Each collision draws a fresh candidate, up to `attempts` candidates in
/// total. Errors other than a collision end allocation immediately.
pub fn allocate_instance_id<F>(
    root: &Path,
    attempts: usize,
    mut candidate: F,
) -> Result<String, SessionError>
where
    F: FnMut() -> String,
{
    fs::create_dir_all(root)?;
    for _ in 0..attempts {
        let id = candidate();
        debug!("Trying instance ID: {}", id);
        match fs::create_dir(root.join(&id)) {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(root.join(&id), fs::Permissions::from_mode(0o700))?;
                }
                return Ok(id);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!("Unable to use instance ID {}", id);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(SessionError::InstanceIdsExhausted(attempts))
}

/// Identity of a running instance, persisted as `key=value` lines so a
/// restarted launcher can find what to tear down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub instance_id: String,
    pub app_id: String,
    pub bus_dir: PathBuf,
    pub bus_dir_a11y: PathBuf,
    pub friendly_name: String,
}

impl ControlRecord {
    pub fn for_session(ctx: &SessionContext) -> Self {
        Self {
            instance_id: ctx.instance_id.clone(),
            app_id: ctx.profile.app_id.clone(),
            bus_dir: ctx.paths.bus_dir(),
            bus_dir_a11y: ctx.paths.a11y_dir(),
            friendly_name: ctx.profile.friendly_name.clone(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "instanceId={}\nappID={}\nbusDir={}\nbusDirAy={}\nfriendlyName={}\n",
            self.instance_id,
            self.app_id,
            self.bus_dir.display(),
            self.bus_dir_a11y.display(),
            self.friendly_name
        )
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, SessionError> {
        let mut record = ControlRecord {
            instance_id: String::new(),
            app_id: String::new(),
            bus_dir: PathBuf::new(),
            bus_dir_a11y: PathBuf::new(),
            friendly_name: String::new(),
        };
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "instanceId" => record.instance_id = value.to_string(),
                "appID" => record.app_id = value.to_string(),
                "busDir" => record.bus_dir = PathBuf::from(value),
                "busDirAy" => record.bus_dir_a11y = PathBuf::from(value),
                "friendlyName" => record.friendly_name = value.to_string(),
                other => debug!("Ignoring control record key {}", other),
            }
        }
        if record.instance_id.is_empty() {
            return Err(SessionError::ControlRecord {
                path: path.to_path_buf(),
                reason: "instanceId missing".into(),
            });
        }
        Ok(record)
    }

    pub fn write(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render())?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, SessionError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path)
    }
}
