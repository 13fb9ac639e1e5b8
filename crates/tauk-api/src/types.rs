use serde::{Deserialize, Serialize};
use tauk_proto::{RunMetadata, UploadResult};

#[derive(Debug, Clone, Serialize)]
pub struct InitializeRunRequest<'a> {
    #[serde(flatten)]
    pub metadata: &'a RunMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeRunResponse {
    pub run_id: Option<String>,
    pub latest_tauk_client_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub result: Option<UploadResult>,
}
