//! The queue owner's internal HTTP API.
//!
//! Routes, all under `/internal` and all behind [`auth::check`]:
//!
//! - `GET /submissions/next` claims the next job
//! - `PUT /submissions/{id}/result` writes a terminal result
//! - `POST /submissions` appends a new submission
//! - `GET /submissions/{id}` reads one submission

pub mod auth;

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use hyper::{
    header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE},
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use serde::Serialize;
use tracing_futures::Instrument;

use crate::{
    client::model::{ErrorMessage, OkMessage, NO_PENDING_SUBMISSIONS, SUBMISSION_UPDATED},
    model::{JudgeResult, NewSubmission, SubmissionId},
    prelude::CancellationTokenHandle,
    queue::{claim_job, MemoryQueue, QueueErr, SubmissionQueue},
};

const MAX_BODY_SIZE: u64 = 4 * 1024 * 1024;

pub struct AppState {
    pub queue: Arc<MemoryQueue>,
    pub api_token: String,
    pub allow_any_network: bool,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let mut res = match serde_json::to_vec(body) {
        Ok(bytes) => Response::new(Body::from(bytes)),
        Err(e) => {
            tracing::error!("Failed to serialize response: {}", e);
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return res;
        }
    };
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    res
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json_response(
        status,
        &ErrorMessage {
            error: message.into(),
        },
    )
}

fn queue_error(e: QueueErr) -> Response<Body> {
    match e {
        QueueErr::NotFound(id) => {
            error_response(StatusCode::NOT_FOUND, format!("Submission {} not found", id))
        }
        QueueErr::NotTerminal(_) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        QueueErr::Unavailable(_) => {
            tracing::error!("{}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.map_or(false, |len| len > MAX_BODY_SIZE) {
        return Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large",
        ));
    }
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;
    serde_json::from_slice(&body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid body: {}", e)))
}

async fn next_submission(state: &AppState) -> Response<Body> {
    match claim_job(&*state.queue).await {
        Ok(Some(job)) => {
            tracing::info!(submission_id = job.submission.id, "Handed out submission");
            json_response(StatusCode::OK, &job)
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, NO_PENDING_SUBMISSIONS),
        Err(e) => queue_error(e),
    }
}

async fn update_result(state: &AppState, id: SubmissionId, req: Request<Body>) -> Response<Body> {
    let result = match read_json::<JudgeResult>(req).await {
        Ok(r) => r,
        Err(res) => return res,
    };
    match state.queue.complete(id, &result).await {
        Ok(s) => {
            tracing::info!(submission_id = id, status = %s.status, "Recorded result");
            json_response(
                StatusCode::OK,
                &OkMessage {
                    message: SUBMISSION_UPDATED.into(),
                },
            )
        }
        Err(e) => queue_error(e),
    }
}

async fn create_submission(state: &AppState, req: Request<Body>) -> Response<Body> {
    let new = match read_json::<NewSubmission>(req).await {
        Ok(n) => n,
        Err(res) => return res,
    };
    match state.queue.has_problem(new.problem_id) {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Problem {} not found", new.problem_id),
            )
        }
        Err(e) => return queue_error(e),
    }
    match state.queue.enqueue(new) {
        Ok(s) => {
            tracing::info!(submission_id = s.id, "Accepted new submission");
            json_response(StatusCode::CREATED, &s)
        }
        Err(e) => queue_error(e),
    }
}

async fn get_submission(state: &AppState, id: SubmissionId) -> Response<Body> {
    match state.queue.get(id).await {
        Ok(Some(s)) => json_response(StatusCode::OK, &s),
        Ok(None) => queue_error(QueueErr::NotFound(id)),
        Err(e) => queue_error(e),
    }
}

pub async fn handle(
    state: Arc<AppState>,
    peer: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if let Err(e) = auth::check(
        req.headers(),
        peer.ip(),
        &state.api_token,
        state.allow_any_network,
    ) {
        tracing::debug!(%peer, "Rejected request: {}", e.message());
        return Ok(error_response(e.status(), e.message()));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let rest = match path.strip_prefix("/internal/submissions") {
        Some(rest) => rest,
        None => return Ok(error_response(StatusCode::NOT_FOUND, "No such route")),
    };
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    let res = match (&method, segments.as_slice()) {
        (&Method::GET, ["next"]) => next_submission(&state).await,
        (&Method::POST, []) => create_submission(&state, req).await,
        (&Method::PUT, [id, "result"]) => match id.parse::<SubmissionId>() {
            Ok(id) => update_result(&state, id, req).await,
            Err(_) => error_response(StatusCode::BAD_REQUEST, "Invalid submission ID"),
        },
        (&Method::GET, [id]) => match id.parse::<SubmissionId>() {
            Ok(id) => get_submission(&state, id).await,
            Err(_) => error_response(StatusCode::BAD_REQUEST, "Invalid submission ID"),
        },
        _ => error_response(StatusCode::NOT_FOUND, "No such route"),
    };
    Ok(res)
}

/// Bind the API to `addr`. Returns the bound address and the serving future,
/// which resolves after `shutdown` fires and open connections finish.
pub fn bind(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationTokenHandle,
) -> Result<(SocketAddr, impl Future<Output = hyper::Result<()>>), hyper::Error> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let peer = conn.remote_addr();
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let span = tracing::info_span!("request", method = %req.method(), path = %req.uri().path());
                handle(state.clone(), peer, req).instrument(span)
            }))
        }
    });

    let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    tracing::info!("Internal API listening on {}", local_addr);
    let serving = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
    Ok((local_addr, serving))
}
