use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ENSEMBLE_MEMBERS;
use crate::errors::SimError;
use crate::fingerprint::fingerprint;
use crate::progress::Progress;
use crate::simulator::{DEFAULT_STEP, FlightProfile, Trajectory};
use crate::web::AppState;

/// Single-trajectory request parameters.
#[derive(Debug, Deserialize)]
pub struct PredictParams {
    /// Launch epoch, seconds UTC.
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    /// Launch altitude, meters.
    pub alt: f64,
    /// Burst altitude, meters.
    pub burst: f64,
    /// Float duration, hours. May be zero.
    #[serde(default)]
    pub float: f64,
    /// Ascent rate, m/s.
    pub ascent: f64,
    /// Descent rate, m/s.
    pub descent: f64,
    #[serde(default = "default_coeff")]
    pub coeff: f64,
    pub member: u8,
}

fn default_coeff() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct EnsembleParams {
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub burst: f64,
    #[serde(default)]
    pub float: f64,
    pub ascent: f64,
    pub descent: f64,
    #[serde(default = "default_coeff")]
    pub coeff: f64,
    #[serde(default = "default_perturbations")]
    pub num_perturbations: u32,
    pub password: Option<String>,
}

fn default_perturbations() -> u32 {
    20
}

fn profile_of(
    time: f64,
    lat: f64,
    lon: f64,
    alt: f64,
    burst: f64,
    float: f64,
    ascent: f64,
    descent: f64,
    coeff: f64,
) -> Result<FlightProfile, &'static str> {
    if !(ascent > 0.0) || !(descent > 0.0) {
        return Err("ascent and descent rates must be positive");
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err("latitude out of range");
    }
    if !(float >= 0.0) || !(coeff > 0.0) {
        return Err("float time and descent coefficient must be non-negative");
    }
    Ok(FlightProfile {
        time,
        lat,
        lon,
        alt,
        burst_alt: burst,
        float_hours: float,
        ascent_rate: ascent,
        descent_rate: descent,
        coeff,
        step: DEFAULT_STEP,
    })
}

/// Wire form of a single prediction: the trajectory on success, or one of
/// the short-form sentinels.
enum PredictResponse {
    Path(Arc<Trajectory>),
    OutOfDomain,
    Failed,
}

impl Serialize for PredictResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PredictResponse::Path(trajectory) => trajectory.serialize(serializer),
            PredictResponse::OutOfDomain => serializer.serialize_str("alt error"),
            PredictResponse::Failed => serializer.serialize_str("error"),
        }
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "no complete forecast cycle available",
    )
        .into_response()
}

/// GET /predict - one deterministic trajectory for one ensemble member.
pub async fn predict(
    State(state): State<AppState>,
    Query(params): Query<PredictParams>,
) -> Response {
    if params.member >= ENSEMBLE_MEMBERS {
        return (StatusCode::BAD_REQUEST, "member out of range").into_response();
    }
    let profile = match profile_of(
        params.time,
        params.lat,
        params.lon,
        params.alt,
        params.burst,
        params.float,
        params.ascent,
        params.descent,
        params.coeff,
    ) {
        Ok(profile) => profile,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };

    let key = fingerprint(&profile.request_key(params.member as i32));
    if let Some(cached) = state.predictions.get(&key) {
        return Json(PredictResponse::Path(cached)).into_response();
    }

    // Client disconnect cancels the integration at its next step.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = tokio::time::timeout(
        state.config.request_deadline,
        run_single(&state, profile, params.member, cancel.clone()),
    )
    .await
    .unwrap_or(Err(SimError::Timeout));

    match result {
        Ok(trajectory) => {
            let trajectory = Arc::new(trajectory);
            state.predictions.insert(key, trajectory.clone());
            Json(PredictResponse::Path(trajectory)).into_response()
        }
        Err(SimError::OutOfDomain) => Json(PredictResponse::OutOfDomain).into_response(),
        Err(SimError::CycleUnavailable) => unavailable(),
        Err(err) => {
            error!("prediction failed: {}", err);
            Json(PredictResponse::Failed).into_response()
        }
    }
}

async fn run_single(
    state: &AppState,
    profile: FlightProfile,
    member: u8,
    cancel: CancellationToken,
) -> Result<Trajectory, SimError> {
    let lease = state.sim_cache.acquire(member).await?;
    tokio::task::spawn_blocking(move || {
        let result = lease.fly(&profile, &cancel);
        drop(lease);
        result
    })
    .await
    .map_err(|_| SimError::IntegratorFailed)?
}

/// GET /ensemble - 21 member trajectories plus Monte-Carlo landing spread.
pub async fn ensemble(
    State(state): State<AppState>,
    Query(params): Query<EnsembleParams>,
) -> Response {
    if let Some(expected) = &state.config.ensemble_password
        && params.password.as_deref() != Some(expected.as_str())
    {
        return (StatusCode::FORBIDDEN, "ensemble password required").into_response();
    }

    let profile = match profile_of(
        params.time,
        params.lat,
        params.lon,
        params.alt,
        params.burst,
        params.float,
        params.ascent,
        params.descent,
        params.coeff,
    ) {
        Ok(profile) => profile,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };

    let members: Vec<u8> = (0..ENSEMBLE_MEMBERS).collect();
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state
        .orchestrator
        .run(
            profile,
            &members,
            params.num_perturbations,
            None,
            state.config.request_deadline,
            cancel,
        )
        .await;

    match result {
        Ok(ensemble) => {
            info!(
                "ensemble {} complete: {} paths, {} landings",
                ensemble.request_id,
                ensemble.paths.len(),
                ensemble.landings.len()
            );
            Json(ensemble).into_response()
        }
        Err(SimError::CycleUnavailable) => unavailable(),
        Err(SimError::Cancelled) => {
            (StatusCode::REQUEST_TIMEOUT, "request cancelled").into_response()
        }
        Err(err) => {
            error!("ensemble failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "ensemble failed").into_response()
        }
    }
}

#[derive(Serialize)]
struct ProgressFrame {
    percentage: u32,
    status: crate::progress::ProgressStatus,
    done_ensemble: u32,
    done_monte_carlo: u32,
}

impl From<&Progress> for ProgressFrame {
    fn from(p: &Progress) -> Self {
        Self {
            percentage: p.percentage(),
            status: p.status,
            done_ensemble: p.done_ensemble,
            done_monte_carlo: p.done_monte_carlo,
        }
    }
}

/// GET /progress/{request_id} - SSE stream of ensemble progress until the
/// request reaches 100% or a terminal status.
pub async fn progress(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    if state.progress.read(&request_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown request id").into_response();
    }

    let stream = progress_stream(state, request_id);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn progress_stream(
    state: AppState,
    request_id: String,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    futures_util::stream::unfold(
        (state, request_id, false),
        |(state, request_id, finished)| async move {
            if finished {
                return None;
            }
            let Some(progress) = state.progress.read(&request_id) else {
                return None;
            };
            let terminal = progress.status.is_terminal() || progress.percentage() >= 100;
            let event = Event::default().json_data(ProgressFrame::from(&progress));
            if !terminal {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Some((event, (state, request_id, terminal)))
        },
    )
}

#[derive(Serialize)]
pub(crate) struct StatusBody {
    active_cycle: Option<String>,
    epoch: u64,
    cache_mode: &'static str,
}

/// GET /status - liveness plus the active cycle view.
pub async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let (cycle, epoch) = state.cycles.state().observe();
    Json(StatusBody {
        active_cycle: cycle.map(|c| c.to_string()),
        epoch,
        cache_mode: match state.sim_cache.mode() {
            crate::simulator_cache::CacheMode::Ensemble => "ensemble",
            crate::simulator_cache::CacheMode::Normal => "normal",
        },
    })
}

/// GET /metrics - Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.render().into_response()
}
