use std::io::Write;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED,
};
use tracing::{debug, info};

use super::checkin::CheckinBatch;
use super::error::FatalError;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ceiling on any single request. Exceeding it is a transport fault.
const REQUEST_CEILING_SECS: u64 = 300;

/// Raw result of the conditional plan fetch; decoding is the plan module's
/// concern.
#[derive(Debug)]
pub enum PlanFetch {
    NotModified,
    Body {
        body: Vec<u8>,
        gzipped: bool,
        last_modified: Option<String>,
    },
}

/// Protocol framing over HTTP: the conditional plan GET and the compressed
/// checkin POST. Client identity rides along on every request.
pub struct ServerClient {
    http: reqwest::Client,
    server: String,
    client_key: String,
    hostname: String,
}

impl ServerClient {
    pub fn new(server: &str, client_key: &str) -> anyhow::Result<Self> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let http = reqwest::Client::builder()
            .user_agent(format!("vigil/{}", AGENT_VERSION))
            .timeout(Duration::from_secs(REQUEST_CEILING_SECS))
            .build()?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            client_key: client_key.to_string(),
            hostname,
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/clients/{}/{}", self.server, self.client_key, tail)
    }

    fn decorate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("x-agent-version", AGENT_VERSION)
            .header("x-agent-hostname", &self.hostname)
            .header(ACCEPT_ENCODING, "gzip")
    }

    /// Conditional GET of the plan. A "Not Modified" answer is a first-class
    /// outcome, not an error.
    pub async fn fetch_plan(&self, token: Option<&str>) -> Result<PlanFetch, FatalError> {
        let url = self.url("plan");
        info!("Loading plan from {}...", url);
        let mut request = self
            .decorate(self.http.get(&url))
            .query(&[("version", AGENT_VERSION)]);
        if let Some(token) = token {
            request = request.header(IF_MODIFIED_SINCE, token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FatalError::TransmissionFailed(e.to_string()))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(PlanFetch::NotModified);
        }
        if !response.status().is_success() {
            return Err(FatalError::TransmissionFailed(format!(
                "could not retrieve plan from server: {}",
                response.status()
            )));
        }
        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
            .unwrap_or(false);
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| FatalError::TransmissionFailed(e.to_string()))?
            .to_vec();
        Ok(PlanFetch::Body {
            body,
            gzipped,
            last_modified,
        })
    }

    /// Ships one batch as gzip-compressed JSON.
    pub async fn post_checkin(&self, batch: &CheckinBatch) -> Result<(), FatalError> {
        let url = self.url("checkin");
        let body = compress_batch(batch)?;
        debug!("Sending checkin to {} ({} bytes gzipped)...", url, body.len());
        let response = self
            .decorate(self.http.post(&url))
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| FatalError::TransmissionFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(FatalError::TransmissionFailed(format!(
                "unable to send checkin to server: {}",
                response.status()
            )))
        }
    }
}

fn compress_batch(batch: &CheckinBatch) -> Result<Vec<u8>, FatalError> {
    let json =
        serde_json::to_vec(batch).map_err(|e| FatalError::TransmissionFailed(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|()| encoder.finish())
        .map_err(|e| FatalError::TransmissionFailed(e.to_string()))
}
