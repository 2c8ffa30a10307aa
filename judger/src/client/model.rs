//! Message bodies of the HTTP protocol between workers and the queue owner.

use serde::{Deserialize, Serialize};

pub const NO_PENDING_SUBMISSIONS: &str = "No pending submissions found";
pub const SUBMISSION_UPDATED: &str = "Submission updated successfully";
pub const MISSING_TOKEN: &str = "Missing API token";
pub const INVALID_TOKEN: &str = "Invalid API token";
pub const EXTERNAL_NETWORK: &str = "Access denied from external network";

pub const API_TOKEN_HEADER: &str = "x-api-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkMessage {
    pub message: String,
}
