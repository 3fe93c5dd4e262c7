//! Request / response bodies for the mesh-daemon HTTP surface.

use serde::{Deserialize, Serialize};

use mesh_schemas::{Envelope, LagSnapshot, PublishResult, VisibilityToken};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<Envelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub results: Vec<PublishResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub tenant_id: String,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_visibility_token: Option<VisibilityToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub degraded_tenants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagParams {
    pub tenant_id: String,
}

pub type LagResponse = LagSnapshot;

/// Error body shared by the failure paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_watermark: Option<VisibilityToken>,
}
