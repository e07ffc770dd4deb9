//! Local HTTP service for starting auxiliary processes inside the sandbox.
//!
//! `POST /start` takes `{Exec, CustomTarget, Files}` and answers
//! `{Success, ID}`. The `/stream/*` endpoints forward one standard stream
//! of the process named by the `Portable` request header.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{any, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::counter::CounterHandle;
use super::table::{Claim, ProcessRecord, ProcessTable};
use super::target::{PassFiles, TargetPlan};
use crate::error::SupervisorError;

/// Request header carrying the numeric process id.
pub const ID_HEADER: &str = "portable";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartRequest {
    pub exec: Vec<String>,
    #[serde(default)]
    pub custom_target: bool,
    #[serde(default)]
    pub files: PassFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "ID")]
    pub id: u64,
}

impl StartResponse {
    fn failed() -> Self {
        Self {
            success: false,
            id: 0,
        }
    }
}

pub type IdSource = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Non-zero random process id.
pub fn random_id() -> u64 {
    use rand::RngExt;
    rand::rng().random_range(1..=i64::MAX as u64)
}

#[derive(Clone)]
pub struct ServiceState {
    table: Arc<RwLock<ProcessTable>>,
    counter: CounterHandle,
    plan: Arc<TargetPlan>,
    ids: IdSource,
}

impl ServiceState {
    pub fn new(plan: TargetPlan, counter: CounterHandle) -> Self {
        Self::with_ids(plan, counter, Arc::new(random_id))
    }

    pub fn with_ids(plan: TargetPlan, counter: CounterHandle, ids: IdSource) -> Self {
        Self {
            table: Arc::new(RwLock::new(ProcessTable::new())),
            counter,
            plan: Arc::new(plan),
            ids,
        }
    }

    pub fn table(&self) -> &Arc<RwLock<ProcessTable>> {
        &self.table
    }

    /// Spawn `cmdline` with piped stdio and start tracking it.
    pub async fn spawn(&self, cmdline: Vec<String>) -> Result<u64, SupervisorError> {
        let (program, args) = cmdline.split_first().ok_or(SupervisorError::EmptyTarget)?;
        info!("Executing command: {}", cmdline.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                command: cmdline.join(" "),
                source,
            })?;
        let record = ProcessRecord::new(
            cmdline,
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        );
        let ids = &self.ids;
        let id = self.table.write().await.insert_with(|| (**ids)(), record);
        debug!("Selected ID {}", id);

        self.counter.spawned();
        tokio::spawn(watch(child, id, Arc::clone(&self.table), self.counter.clone()));
        Ok(id)
    }
}

async fn watch(mut child: Child, id: u64, table: Arc<RwLock<ProcessTable>>, counter: CounterHandle) {
    match child.wait().await {
        Ok(status) => debug!("Process {} exited with {}", id, status),
        Err(e) => warn!("Could not wait for process {}: {}", id, e),
    }
    counter.exited();
    table.write().await.tombstone(id);
}

async fn start(State(state): State<ServiceState>, body: Bytes) -> Response {
    let request: StartRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("Could not decode request: {}", e);
            return (StatusCode::BAD_REQUEST, Json(StartResponse::failed())).into_response();
        }
    };
    debug!("Got file map from request: {:?}", request.files.file_map);
    let cmdline = state
        .plan
        .auxiliary(&request.exec, request.custom_target, &request.files);
    match state.spawn(cmdline).await {
        Ok(id) => Json(StartResponse { success: true, id }).into_response(),
        Err(e) => {
            warn!("Could not start command: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(StartResponse::failed())).into_response()
        }
    }
}

fn request_id(headers: &HeaderMap) -> Option<u64> {
    headers.get(ID_HEADER)?.to_str().ok()?.trim().parse().ok()
}

fn claim_status(claim: Claim) -> StatusCode {
    match claim {
        Claim::Unknown => StatusCode::NOT_FOUND,
        Claim::Gone => StatusCode::GONE,
        Claim::AlreadyClaimed => StatusCode::CONFLICT,
    }
}

async fn stream_stdin(State(state): State<ServiceState>, headers: HeaderMap, body: Body) -> Response {
    let Some(id) = request_id(&headers) else {
        debug!("Could not handle stdin pipe request");
        return StatusCode::NOT_FOUND.into_response();
    };
    let claimed = state.table.write().await.claim_stdin(id);
    let mut stdin = match claimed {
        Ok(stdin) => stdin,
        Err(claim) => return claim_status(claim).into_response(),
    };
    debug!("Handling stdin request for ID {}", id);

    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Could not read stdin body for {}: {}", id, e);
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        };
        if let Err(e) = stdin.write_all(&chunk).await {
            warn!("Could not stream stdin for {}: {}", id, e);
            return (StatusCode::GONE, e.to_string()).into_response();
        }
    }
    StatusCode::OK.into_response()
}

#[derive(Debug, Clone, Copy)]
enum Output {
    Stdout,
    Stderr,
}

async fn stream_output(state: ServiceState, headers: HeaderMap, which: Output) -> Response {
    let Some(id) = request_id(&headers) else {
        debug!("Could not handle {:?} pipe request", which);
        return StatusCode::NOT_FOUND.into_response();
    };
    let body = {
        let mut table = state.table.write().await;
        match which {
            Output::Stdout => table.claim_stdout(id).map(|s| Body::from_stream(ReaderStream::new(s))),
            Output::Stderr => table.claim_stderr(id).map(|s| Body::from_stream(ReaderStream::new(s))),
        }
    };
    match body {
        Ok(body) => {
            debug!("Handling {:?} request for ID {}", which, id);
            ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
        }
        Err(claim) => claim_status(claim).into_response(),
    }
}

async fn stream_stdout(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    stream_output(state, headers, Output::Stdout).await
}

async fn stream_stderr(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    stream_output(state, headers, Output::Stderr).await
}

pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/stream/stdin", any(stream_stdin))
        .route("/stream/stdout", any(stream_stdout))
        .route("/stream/stderr", any(stream_stderr))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the service socket, replacing a stale one.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    UnixListener::bind(path)
}

pub async fn serve(listener: UnixListener, state: ServiceState) -> io::Result<()> {
    axum::serve(listener, router(state)).await
}
