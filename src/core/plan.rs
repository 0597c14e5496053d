use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use super::error::FatalError;
use super::transport::{PlanFetch, ServerClient};

/// One named, versioned check assigned by the server: a unit of loadable
/// code plus options and an interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    /// Source of the plugin unit, compiled fresh on every run.
    pub code: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Minutes between runs.
    pub interval: u32,
    /// Per-plugin execution bound in seconds, overriding the default.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Diagnostic label, usually the server-side path of the plugin source.
    #[serde(default)]
    pub path: Option<String>,
}

impl PluginSpec {
    /// History key. Ad-hoc plugins without an id fall back to the bare name.
    pub fn key(&self) -> String {
        match self.id {
            Some(id) => format!("{}-{}", id, self.name),
            None => self.name.clone(),
        }
    }

    /// Key used by records persisted before plugin ids existed.
    pub fn legacy_key(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// Server-controlled knobs accompanying each plan. Keys this build does not
/// know about are preserved round-trip rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directives {
    /// Minutes between checkins.
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub take_snapshots: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct PlanPayload {
    pub plugins: Vec<PluginSpec>,
    #[serde(default)]
    pub directives: Directives,
}

/// Result of the conditional plan refetch.
#[derive(Debug)]
pub enum PlanOutcome {
    /// The server's plan has not changed; the caller must reuse the
    /// persisted plan and directives verbatim.
    Unchanged,
    Fresh {
        plugins: Vec<PluginSpec>,
        directives: Directives,
        token: Option<String>,
    },
}

/// Fetches the plan, reusing the cached copy when the server reports it
/// unmodified since `cached_token`.
pub async fn fetch(
    client: &ServerClient,
    cached_token: Option<&str>,
) -> Result<PlanOutcome, FatalError> {
    match client.fetch_plan(cached_token).await? {
        PlanFetch::NotModified => {
            info!("Plan not modified, reusing cached plan.");
            Ok(PlanOutcome::Unchanged)
        }
        PlanFetch::Body {
            body,
            gzipped,
            last_modified,
        } => {
            let payload = decode_plan(&body, gzipped)?;
            info!(
                "Plan loaded. ({} plugins: {})",
                payload.plugins.len(),
                payload
                    .plugins
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(PlanOutcome::Fresh {
                plugins: payload.plugins,
                directives: payload.directives,
                token: last_modified,
            })
        }
    }
}

/// Decodes a plan body into plugins and directives. Anything unparsable is
/// fatal for the pass; the previously persisted plan is left untouched.
pub fn decode_plan(body: &[u8], gzipped: bool) -> Result<PlanPayload, FatalError> {
    let raw = if gzipped {
        let mut decoder = GzDecoder::new(body);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| FatalError::PlanMalformed(format!("bad gzip body: {}", e)))?;
        out
    } else {
        body.to_vec()
    };
    serde_json::from_slice(&raw).map_err(|e| FatalError::PlanMalformed(e.to_string()))
}
