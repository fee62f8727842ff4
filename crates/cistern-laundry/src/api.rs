//! HTTP API for the laundry node.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cistern_supply::{FillReport, PoolStatus};
use cistern_transfer::{Quantity, ResourceKind, StreamEnd, SupplyStream, TransferError};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::Error;
use crate::models::{Demand, Job, JobId, JobStatus, LoadType};
use crate::node::LaundryState;
use crate::unit::UnitSnapshot;

type AppState = Arc<LaundryState>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Jobs
        .route("/api/v1/jobs", get(list_jobs).post(submit_job))
        .route("/api/v1/jobs/:id", get(get_job))
        // Supply
        .route("/api/v1/supply/:kind", get(request_supply))
        .route("/api/v1/tank/fill", post(fill_tank))
        .route("/api/v1/status", get(status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) | Error::Transfer(TransferError::InvalidQuantity) => StatusCode::BAD_REQUEST,
            Error::ResourceExhausted { .. } | Error::Transfer(TransferError::Exhausted { .. }) => StatusCode::CONFLICT,
            Error::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

// --- Jobs ---

/// Either a standard load number or an explicit demand.
#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    load: Option<u8>,
    demand: Option<Demand>,
    #[serde(default)]
    priority: i32,
}

impl SubmitJobRequest {
    fn into_demand(self) -> Result<Demand, Error> {
        match (self.load, self.demand) {
            (Some(load), None) => LoadType::try_from(load)
                .map(Demand::for_load)
                .map_err(Error::InvalidRequest),
            (None, Some(demand)) => Ok(demand),
            _ => Err(Error::InvalidRequest("give exactly one of load or demand".into())),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: JobId,
    status: JobStatus,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), Error> {
    let priority = req.priority;
    let demand = req.into_demand()?;
    let job = state.queue.submit(demand, priority)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.queue.list())
}

async fn get_job(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<Job>, Error> {
    let id = JobId(id);
    state
        .queue
        .get(id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(id.to_string()))
}

// --- Supply ---

#[derive(Debug, Deserialize)]
struct QuantityQuery {
    quantity: Option<i64>,
}

impl QuantityQuery {
    fn quantity(&self) -> Result<Quantity, Error> {
        self.quantity
            .filter(|q| *q > 0)
            .and_then(|q| Quantity::try_from(q).ok())
            .ok_or_else(|| Error::InvalidRequest("quantity must be a positive integer".into()))
    }
}

/// Block lines followed by one `{"end":...}` line naming how the stream ended.
fn json_lines(supply: SupplyStream) -> impl futures::Stream<Item = String> + Send {
    stream::unfold(Some(supply), |supply| async move {
        let mut supply = supply?;
        match supply.next_block().await {
            Some(block) => Some((block.to_json_line(), Some(supply))),
            None => {
                let end = supply.end().unwrap_or(StreamEnd::Interrupted);
                Some((end.to_json_line(), None))
            }
        }
    })
}

/// Stream blocks as newline-delimited JSON, one line per tick.
async fn request_supply(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<QuantityQuery>,
) -> Result<Response, Error> {
    let kind: ResourceKind = kind.parse().map_err(Error::InvalidRequest)?;
    let quantity = query.quantity()?;

    let supply = state.source(kind).request(quantity)?;
    let body = Body::from_stream(json_lines(supply).map(Ok::<_, Infallible>));

    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

async fn fill_tank(
    State(state): State<AppState>,
    Query(query): Query<QuantityQuery>,
) -> Result<(StatusCode, Json<FillReport>), Error> {
    let report = state.tank.fill(query.quantity()?).await?;
    let status = if report.capacity_reached {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

// --- Status ---

#[derive(Debug, Serialize)]
struct NodeStatus {
    pools: Vec<PoolStatus>,
    units: Vec<UnitSnapshot>,
    pending_jobs: usize,
}

async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(NodeStatus {
        pools: vec![state.utility.status(), state.tank.status()],
        units: state.registry().snapshot(),
        pending_jobs: state.queue.pending_len(),
    })
}
