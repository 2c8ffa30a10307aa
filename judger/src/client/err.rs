use err_derive::Error;

use crate::queue::QueueErr;

/// Failures talking to the queue owner. All of them are transient from the
/// worker's point of view.
#[derive(Debug, Error)]
pub enum TransportErr {
    #[error(display = "Web request error: {}", _0)]
    Request(#[error(source)] reqwest::Error),

    #[error(display = "Unexpected status {}: {}", status, body)]
    Status { status: u16, body: String },

    #[error(display = "JSON error: {}", _0)]
    Json(#[error(source)] serde_json::Error),

    #[error(display = "Access token is not a valid header value")]
    BadAccessToken,

    #[error(display = "Queue error: {}", _0)]
    Queue(#[error(source)] QueueErr),
}
