//! The JSON envelope shared by every generated registry document.
//!
//! Each file is written as `{"generatedAt": ..., "generatedBy": "plugforge",
//! <payload fields>}` so a reader can tell when and by what it was produced.

use crate::error::{ForgeError, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub generated_at: DateTime<Utc>,
    pub generated_by: String,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            generated_at: Utc::now(),
            generated_by: paths::TOOL_NAME.to_string(),
            payload,
        }
    }
}

/// Serialize `payload` inside a fresh envelope.
pub fn encode<T: Serialize>(payload: T) -> Result<Vec<u8>> {
    let data = serde_json::to_vec_pretty(&Envelope::new(payload))?;
    Ok(data)
}

/// Read an enveloped document. A missing file means the project was never
/// initialised; an unparsable one is reported with its path.
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<Envelope<T>> {
    if !path.exists() {
        return Err(ForgeError::NotInitialized);
    }
    let data = std::fs::read_to_string(path).map_err(|e| ForgeError::Registry {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&data).map_err(|e| ForgeError::Registry {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Write `payload` to `path` atomically.
pub fn write<T: Serialize>(path: &Path, payload: T) -> Result<()> {
    crate::io::atomic_write(path, &encode(payload)?)
}
