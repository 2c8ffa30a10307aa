//! Where a worker gets its jobs from and reports results to.

pub mod config;
mod err;
pub mod model;

pub use self::err::*;
use self::{config::ClientConfig, model::API_TOKEN_HEADER};
use crate::{
    model::{Job, JudgeResult, SubmissionId},
    queue::{claim_job, SubmissionQueue},
};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    StatusCode,
};
use std::sync::Arc;

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Claim the next job. `Ok(None)` means the backlog is empty.
    async fn fetch_next(&self) -> Result<Option<Job>, TransportErr>;

    /// Write the terminal result of a claimed submission.
    async fn report(&self, id: SubmissionId, result: &JudgeResult) -> Result<(), TransportErr>;
}

/// Talks to a remote queue owner over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    cfg: Arc<ClientConfig>,
}

impl HttpTransport {
    pub fn new(cfg: Arc<ClientConfig>) -> Result<HttpTransport, TransportErr> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &cfg.access_token {
            let value = HeaderValue::from_str(token).map_err(|_| TransportErr::BadAccessToken)?;
            headers.insert(API_TOKEN_HEADER, value);
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .default_headers(headers)
            .build()?;
        Ok(HttpTransport { client, cfg })
    }
}

async fn unexpected_status(res: reqwest::Response) -> TransportErr {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    tracing::debug!(status, %body, "Unexpected response");
    TransportErr::Status { status, body }
}

#[async_trait]
impl JobSource for HttpTransport {
    async fn fetch_next(&self) -> Result<Option<Job>, TransportErr> {
        let endpoint = self.cfg.next_job_endpoint();
        let res = self.client.get(&endpoint).send().await?;
        match res.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if s.is_success() => {}
            _ => return Err(unexpected_status(res).await),
        }
        let body = res.bytes().await?;
        let job = serde_json::from_slice::<Job>(&body)?;
        Ok(Some(job))
    }

    async fn report(&self, id: SubmissionId, result: &JudgeResult) -> Result<(), TransportErr> {
        let endpoint = self.cfg.result_endpoint(id);
        let res = self.client.put(&endpoint).json(result).send().await?;
        if !res.status().is_success() {
            return Err(unexpected_status(res).await);
        }
        Ok(())
    }
}

/// Claims straight from a queue in the same process.
pub struct LocalSource {
    queue: Arc<dyn SubmissionQueue>,
}

impl LocalSource {
    pub fn new(queue: Arc<dyn SubmissionQueue>) -> LocalSource {
        LocalSource { queue }
    }
}

#[async_trait]
impl JobSource for LocalSource {
    async fn fetch_next(&self) -> Result<Option<Job>, TransportErr> {
        Ok(claim_job(&*self.queue).await?)
    }

    async fn report(&self, id: SubmissionId, result: &JudgeResult) -> Result<(), TransportErr> {
        self.queue.complete(id, result).await?;
        Ok(())
    }
}
