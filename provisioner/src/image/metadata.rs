//! Image metadata file format (§4.5): a small JSON object written beside
//! a fetched root filesystem — `{"env": [...], "user": ...}`.

use provisioner_types::ProvisionResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl Metadata {
    pub fn from_json(bytes: &[u8]) -> ProvisionResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| provisioner_types::ProvisionError::InvalidState(format!("bad image metadata: {e}")))
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Metadata serializes")
    }
}
