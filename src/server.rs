use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

use crate::bus::BusTransaction;
use crate::config::{EngineConfig, RunProfile, ServerConfig};
use crate::controller::{ExecutionController, ExecutionObserver, RunStatus};
use crate::cpu::{CycleRecord, StepOutcome};
use crate::error::LoadError;
use crate::memory::{region_of, Region};
use crate::metrics::{init_metrics, record_api_request, set_active_sessions, Timer, REGISTRY};
use crate::program::{AddressMap, Operation};
use crate::snapshots::{
    Checkpoint, CheckpointReason, CheckpointSummary, CreateCheckpointRequest, MachineSnapshot, MemoryCell,
};
use crate::templates::{ProgramTemplate, TemplateSummary};

/// Cycles run per lock acquisition when a profile has no per-cycle delay.
const RUN_SLICE: usize = 512;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("template {0} not found")]
    TemplateNotFound(String),
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session is not running")]
    NotRunning,
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) | ApiError::TemplateNotFound(_) | ApiError::CheckpointNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::AlreadyRunning | ApiError::NotRunning => StatusCode::CONFLICT,
            ApiError::Load(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// An operation sequence plus address map, as handed over by the translator.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramSource {
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub address_map: AddressMap,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub template_id: Option<String>,
    pub program: Option<ProgramSource>,
    pub profile: Option<RunProfile>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    pub start: Option<u8>,
    pub len: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub name: String,
    pub template_id: Option<String>,
    pub profile: RunProfile,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub running: bool,
    pub status: RunStatus,
    pub operations: usize,
    pub snapshot: MachineSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StepView {
    pub record: Option<CycleRecord>,
    pub status: RunStatus,
    pub transactions: Vec<BusTransaction>,
    pub snapshot: MachineSnapshot,
}

/// One memory cell as the memory panel shows it.
#[derive(Debug, Serialize)]
pub struct MemoryRow {
    #[serde(flatten)]
    pub cell: MemoryCell,
    pub region: Region,
    pub variable: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<BusTransaction>,
    /// Pass as `since` to fetch only what comes after this page.
    pub next: u64,
}

pub struct Session {
    pub id: String,
    pub name: String,
    pub template_id: Option<String>,
    pub profile: RunProfile,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub controller: ExecutionController,
    pub checkpoints: Vec<Checkpoint>,
    running: bool,
}

impl Session {
    pub fn new(name: Option<String>, template_id: Option<String>, profile: RunProfile) -> Self {
        let id = Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("{}-{}", profile.as_str(), &id[..8]));
        let now = Utc::now();
        Self {
            id,
            name,
            template_id,
            profile,
            created_at: now,
            last_activity: now,
            controller: ExecutionController::new(EngineConfig::from_profile(profile)),
            checkpoints: Vec::new(),
            running: false,
        }
    }

    pub fn get_view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            name: self.name.clone(),
            template_id: self.template_id.clone(),
            profile: self.profile,
            created_at: self.created_at,
            last_activity: self.last_activity,
            running: self.running,
            status: self.controller.status(),
            operations: self.controller.program().len(),
            snapshot: self.controller.snapshot(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn checkpoint(&mut self, name: Option<String>, reason: CheckpointReason) -> &Checkpoint {
        let checkpoint = Checkpoint::new(&self.id, name, reason, self.controller.snapshot());
        self.checkpoints.push(checkpoint);
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    fn finish_run(&mut self, status: RunStatus) {
        self.running = false;
        let reason = match status {
            RunStatus::Paused => CheckpointReason::Paused,
            RunStatus::Faulted { .. } => CheckpointReason::Faulted,
            _ => CheckpointReason::Halted,
        };
        self.checkpoint(None, reason);
        self.record_activity();
        info!(session = %self.id, ?status, "run finished");
    }

    fn record_activity(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Forwards OUTPUT text to the log; the controller keeps its own copy.
struct SessionObserver<'a> {
    session_id: &'a str,
}

impl ExecutionObserver for SessionObserver<'_> {
    fn on_output(&mut self, text: &str) {
        info!(session = self.session_id, output = text, "program output");
    }
}

type SharedSession = Arc<Mutex<Session>>;
type SessionMap = Arc<Mutex<HashMap<String, SharedSession>>>;

#[derive(Clone)]
pub struct AppState {
    sessions: SessionMap,
    config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    fn session(&self, id: &str) -> Result<SharedSession, ApiError> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn respond<T: Serialize>(method: &str, endpoint: &str, timer: Timer, result: Result<T, ApiError>) -> WithStatus<Json> {
    let (status, reply) = match result {
        Ok(data) => (StatusCode::OK, warp::reply::json(&ApiResponse::success(data))),
        Err(err) => {
            warn!(method, endpoint, error = %err, "request failed");
            (err.status(), warp::reply::json(&ApiResponse::<()>::error(err.to_string())))
        }
    };
    record_api_request(method, endpoint, status.as_u16(), timer.elapsed());
    warp::reply::with_status(reply, status)
}

pub async fn run_server(config: ServerConfig) {
    init_metrics();

    let addr = config.addr;
    let state = AppState::new(config);

    info!(%addr, profile = state.config.default_profile.as_str(), "trace8 server starting");
    info!("  POST   /session                       - Create session (template or program)");
    info!("  GET    /sessions                      - List sessions");
    info!("  GET    /session/:id                   - Session status and snapshot");
    info!("  DELETE /session/:id                   - Delete session");
    info!("  POST   /session/:id/program           - Load a new program");
    info!("  POST   /session/:id/run               - Run in the background");
    info!("  POST   /session/:id/pause             - Pause at the next cycle boundary");
    info!("  POST   /session/:id/resume            - Resume a paused run");
    info!("  POST   /session/:id/reset             - Back to the initial state");
    info!("  POST   /session/:id/step              - Execute one cycle");
    info!("  GET    /session/:id/transactions      - Bus log (?since=N)");
    info!("  GET    /session/:id/output            - OUTPUT lines");
    info!("  GET    /session/:id/memory            - Memory window (?start=&len=)");
    info!("  POST   /session/:id/checkpoint        - Save a checkpoint");
    info!("  GET    /session/:id/checkpoints       - List checkpoints");
    info!("  GET    /templates                     - Built-in programs");
    info!("  GET    /metrics                       - Prometheus metrics");

    warp::serve(routes(state)).run(addr).await;
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "DELETE"]);

    let create_session = warp::path("session")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .map(create_session_handler);

    let list_sessions = warp::path("sessions")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(list_sessions_handler);

    let get_session = warp::path!("session" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(get_session_handler);

    let delete_session = warp::path!("session" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .map(delete_session_handler);

    let load_program = warp::path!("session" / String / "program")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .map(load_program_handler);

    let run_session = warp::path!("session" / String / "run")
        .and(warp::post())
        .and(with_state(state.clone()))
        .map(|id: String, state: AppState| run_handler(id, state, "/session/:id/run"));

    let resume_session = warp::path!("session" / String / "resume")
        .and(warp::post())
        .and(with_state(state.clone()))
        .map(|id: String, state: AppState| run_handler(id, state, "/session/:id/resume"));

    let pause_session = warp::path!("session" / String / "pause")
        .and(warp::post())
        .and(with_state(state.clone()))
        .map(pause_handler);

    let reset_session = warp::path!("session" / String / "reset")
        .and(warp::post())
        .and(with_state(state.clone()))
        .map(reset_handler);

    let step_session = warp::path!("session" / String / "step")
        .and(warp::post())
        .and(with_state(state.clone()))
        .map(step_handler);

    let transactions = warp::path!("session" / String / "transactions")
        .and(warp::get())
        .and(warp::query::<TransactionQuery>())
        .and(with_state(state.clone()))
        .map(transactions_handler);

    let output = warp::path!("session" / String / "output")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(output_handler);

    let memory = warp::path!("session" / String / "memory")
        .and(warp::get())
        .and(warp::query::<MemoryQuery>())
        .and(with_state(state.clone()))
        .map(memory_handler);

    let create_checkpoint = warp::path!("session" / String / "checkpoint")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .map(create_checkpoint_handler);

    let list_checkpoints = warp::path!("session" / String / "checkpoints")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(list_checkpoints_handler);

    let get_checkpoint = warp::path!("session" / String / "checkpoints" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(get_checkpoint_handler);

    let list_templates = warp::path("templates")
        .and(warp::path::end())
        .and(warp::get())
        .map(list_templates_handler);

    let get_template = warp::path!("templates" / String)
        .and(warp::get())
        .map(get_template_handler);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(metrics_handler);

    create_session
        .or(list_sessions)
        .or(get_session)
        .or(delete_session)
        .or(load_program)
        .or(run_session)
        .or(resume_session)
        .or(pause_session)
        .or(reset_session)
        .or(step_session)
        .or(transactions)
        .or(output)
        .or(memory)
        .or(create_checkpoint)
        .or(list_checkpoints)
        .or(get_checkpoint)
        .or(list_templates)
        .or(get_template)
        .or(metrics)
        .with(cors)
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn create_session_handler(request: CreateSessionRequest, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = (|| -> Result<SessionView, ApiError> {
        let template = match &request.template_id {
            Some(id) => Some(ProgramTemplate::find(id)?.ok_or_else(|| ApiError::TemplateNotFound(id.clone()))?),
            None => None,
        };
        let profile = request
            .profile
            .or(template.as_ref().map(|t| t.profile))
            .unwrap_or(state.config.default_profile);
        let mut session = Session::new(request.name, request.template_id, profile);

        if let Some(template) = &template {
            session.controller.load_program(template.build()?);
        }
        if let Some(program) = request.program {
            session.controller.load(program.operations, program.address_map)?;
        }

        let view = session.get_view();
        let mut sessions = lock(&state.sessions);
        sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
        set_active_sessions(sessions.len());
        info!(session = %view.id, profile = profile.as_str(), "session created");
        Ok(view)
    })();
    respond("POST", "/session", timer, result)
}

fn list_sessions_handler(state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let sessions: Vec<SharedSession> = lock(&state.sessions).values().cloned().collect();
    let views: Vec<SessionView> = sessions.iter().map(|s| lock(s).get_view()).collect();
    respond("GET", "/sessions", timer, Ok(views))
}

fn get_session_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).map(|s| lock(&s).get_view());
    respond("GET", "/session/:id", timer, result)
}

fn delete_session_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = {
        let mut sessions = lock(&state.sessions);
        match sessions.remove(&id) {
            Some(session) => {
                // a background run stops at its next slice
                lock(&session).controller.pause();
                set_active_sessions(sessions.len());
                info!(session = %id, "session deleted");
                Ok(format!("Session {id} deleted"))
            }
            None => Err(ApiError::SessionNotFound(id)),
        }
    };
    respond("DELETE", "/session/:id", timer, result)
}

fn load_program_handler(id: String, program: ProgramSource, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).and_then(|shared| {
        let mut session = lock(&shared);
        if session.running {
            return Err(ApiError::AlreadyRunning);
        }
        session.controller.load(program.operations, program.address_map)?;
        session.template_id = None;
        session.record_activity();
        Ok(session.get_view())
    });
    respond("POST", "/session/:id/program", timer, result)
}

fn run_handler(id: String, state: AppState, endpoint: &'static str) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).and_then(|shared| {
        let mut session = lock(&shared);
        if session.running {
            return Err(ApiError::AlreadyRunning);
        }
        session.record_activity();
        if !session.controller.status().is_terminal() {
            session.running = true;
            tokio::spawn(drive(shared.clone()));
        }
        Ok(session.get_view())
    });
    respond("POST", endpoint, timer, result)
}

/// Background run loop. The session lock is only held for one slice at a
/// time so snapshots and pause requests get through while it runs. The run
/// is wound up under the same lock as its last slice, so a pause can never
/// arrive after the loop has stopped looking for one.
async fn drive(shared: SharedSession) {
    loop {
        let delay = {
            let mut session = lock(&shared);
            let delay = session.profile.get_limits().cycle_delay();
            let budget = if delay.is_zero() { RUN_SLICE } else { 1 };
            let id = session.id.clone();
            let mut observer = SessionObserver { session_id: &id };
            let status = session.controller.run_slice(budget, &mut observer);
            if status != RunStatus::Ready {
                session.finish_run(status);
                return;
            }
            delay
        };

        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

fn pause_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).and_then(|shared| {
        let mut session = lock(&shared);
        if !session.running {
            return Err(ApiError::NotRunning);
        }
        session.controller.pause();
        session.record_activity();
        Ok(session.get_view())
    });
    respond("POST", "/session/:id/pause", timer, result)
}

fn reset_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).and_then(|shared| {
        let mut session = lock(&shared);
        if session.running {
            return Err(ApiError::AlreadyRunning);
        }
        session.controller.reset();
        session.record_activity();
        Ok(session.get_view())
    });
    respond("POST", "/session/:id/reset", timer, result)
}

fn step_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).and_then(|shared| {
        let mut session = lock(&shared);
        if session.running {
            return Err(ApiError::AlreadyRunning);
        }
        let session = &mut *session;
        let before = session.controller.snapshot().transaction_count;
        let mut observer = SessionObserver { session_id: &session.id };
        let record = match session.controller.step(&mut observer) {
            StepOutcome::Cycle(record) => Some(record),
            StepOutcome::Halted | StepOutcome::Faulted(_) => None,
        };
        session.record_activity();
        Ok(StepView {
            record,
            status: session.controller.status(),
            transactions: session.controller.transactions_since(before).to_vec(),
            snapshot: session.controller.snapshot(),
        })
    });
    respond("POST", "/session/:id/step", timer, result)
}

fn transactions_handler(id: String, query: TransactionQuery, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).map(|shared| {
        let session = lock(&shared);
        let transactions = session.controller.transactions_since(query.since.unwrap_or(0)).to_vec();
        let next = session.controller.snapshot().transaction_count;
        TransactionPage { transactions, next }
    });
    respond("GET", "/session/:id/transactions", timer, result)
}

fn output_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).map(|shared| lock(&shared).controller.outputs().to_vec());
    respond("GET", "/session/:id/output", timer, result)
}

fn memory_handler(id: String, query: MemoryQuery, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result: Result<Vec<MemoryRow>, ApiError> = state.session(&id).map(|shared| {
        let session = lock(&shared);
        let map = session.controller.program().address_map();
        let len = query.len.unwrap_or(session.controller.config().memory_window);
        session
            .controller
            .snapshot()
            .memory_window(query.start.unwrap_or(0), len)
            .into_iter()
            .map(|cell| MemoryRow {
                region: region_of(cell.address),
                variable: map.name_at(cell.address),
                cell,
            })
            .collect()
    });
    respond("GET", "/session/:id/memory", timer, result)
}

fn create_checkpoint_handler(id: String, request: CreateCheckpointRequest, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).map(|shared| {
        let mut session = lock(&shared);
        let reason = Checkpoint::reason_for(session.controller.snapshot().phase);
        let summary = session.checkpoint(request.name, reason).get_summary();
        info!(session = %id, checkpoint = %summary.id, name = %summary.name, "checkpoint saved");
        summary
    });
    respond("POST", "/session/:id/checkpoint", timer, result)
}

fn list_checkpoints_handler(id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result: Result<Vec<CheckpointSummary>, ApiError> = state
        .session(&id)
        .map(|shared| lock(&shared).checkpoints.iter().map(Checkpoint::get_summary).collect());
    respond("GET", "/session/:id/checkpoints", timer, result)
}

fn get_checkpoint_handler(id: String, checkpoint_id: String, state: AppState) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = state.session(&id).and_then(|shared| {
        lock(&shared)
            .checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned()
            .ok_or(ApiError::CheckpointNotFound(checkpoint_id))
    });
    respond("GET", "/session/:id/checkpoints/:cid", timer, result)
}

fn list_templates_handler() -> WithStatus<Json> {
    let timer = Timer::new();
    let result: Result<Vec<TemplateSummary>, ApiError> = ProgramTemplate::create_builtin_templates()
        .map(|templates| templates.iter().map(ProgramTemplate::get_summary).collect())
        .map_err(ApiError::from);
    respond("GET", "/templates", timer, result)
}

fn get_template_handler(id: String) -> WithStatus<Json> {
    let timer = Timer::new();
    let result = ProgramTemplate::find(&id)
        .map_err(ApiError::from)
        .and_then(|t| t.ok_or(ApiError::TemplateNotFound(id)));
    respond("GET", "/templates/:id", timer, result)
}

fn metrics_handler() -> impl warp::Reply {
    let timer = Timer::new();
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => {
            record_api_request("GET", "/metrics", 200, timer.elapsed());
            warp::reply::with_status(
                warp::reply::with_header(metrics_text, "content-type", "text/plain; version=0.0.4"),
                StatusCode::OK,
            )
        }
        Err(err) => {
            record_api_request("GET", "/metrics", 500, timer.elapsed());
            warp::reply::with_status(
                warp::reply::with_header(format!("Error encoding metrics: {err}"), "content-type", "text/plain"),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}
