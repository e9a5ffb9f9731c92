use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;

use super::{CacheKey, DEFAULT_PROTO};

/// Persisted HTTP response envelope written next to each data file. It lets a
/// cache hit replay the original status line and headers, and lets a restart
/// rebuild the index from disk alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFile {
    pub status: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub proto: String,
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "contentLength")]
    pub content_length: i64,
    pub uncompressed: bool,
    #[serde(rename = "cacheKey")]
    pub cache_key: String,
}

impl ResponseFile {
    pub fn new(
        content_length: i64,
        status: StatusCode,
        headers: &HeaderMap,
        cache_key: &CacheKey,
    ) -> Self {
        Self {
            status: status.canonical_reason().unwrap_or_default().to_string(),
            status_code: status.as_u16(),
            proto: DEFAULT_PROTO.to_string(),
            header: headers_to_map(headers),
            content_length,
            uncompressed: false,
            cache_key: cache_key.as_str().to_string(),
        }
    }

    /// Serialize to the sidecar path. Called on the write path, so async.
    pub async fn dump(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        async_fs::write(path, data)
            .await
            .with_context(|| format!("failed to write sidecar {}", path.display()))?;
        Ok(())
    }

    /// Parse a sidecar from disk. Called from the blocking restore walk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read sidecar {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse sidecar {}", path.display()))
    }

    /// Rebuild an `http::HeaderMap` from the persisted name → values map.
    /// Names or values that no longer parse are dropped rather than failing
    /// the whole hit.
    pub fn headers(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.header {
            let Ok(name) = http::header::HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = http::HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}
