use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use crate::error::UploadError;
use crate::mirror::local_file_path;
use crate::platform::{UploadRequest, WikiPlatform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOutcome {
    /// Answered from the cache, no network call.
    Cached,
    Uploaded,
    /// The platform already had it; memoized like a fresh upload.
    AlreadyOnPlatform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetResolution {
    pub remote_url: String,
    pub outcome: AssetOutcome,
}

/// Normalized local asset path -> absolute remote URL, scoped to one
/// migration run. Every asset is uploaded at most once per cache.
#[derive(Debug, Clone, Default)]
pub struct UploadCache {
    entries: BTreeMap<String, String>,
}

impl UploadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, remote_url: impl Into<String>) {
        self.entries.insert(key.into(), remote_url.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remote URL for the asset at `key` (relative to `project_path`),
    /// uploading it on first sight.
    pub fn resolve<P: WikiPlatform + ?Sized>(
        &mut self,
        platform: &mut P,
        project_path: &Path,
        key: &str,
        force: bool,
    ) -> Result<AssetResolution, UploadError> {
        if let Some(remote_url) = self.entries.get(key) {
            return Ok(AssetResolution {
                remote_url: remote_url.clone(),
                outcome: AssetOutcome::Cached,
            });
        }

        let local_path = local_file_path(project_path, key);
        let request = UploadRequest {
            local_path: &local_path,
            namespace_offset: "",
            is_asset: true,
            force,
        };
        let (remote, outcome) = match platform.upload(&request) {
            Ok(remote) => (remote, AssetOutcome::Uploaded),
            Err(error) => match error.memoized_remote() {
                Some(remote) => {
                    warn!("{key}: {error}; reusing existing upload");
                    (remote.to_string(), AssetOutcome::AlreadyOnPlatform)
                }
                None => return Err(error),
            },
        };

        let remote_url = platform.resolve_asset_url(&remote)?;
        info!("uploaded {key} -> {remote_url}");
        self.entries.insert(key.to_string(), remote_url.clone());
        Ok(AssetResolution {
            remote_url,
            outcome,
        })
    }
}

/// Resolve an asset reference found in the file at `referrer` (both relative
/// to the mirror root) to the referenced file's mirror-relative path.
/// Returns `None` for references that climb above the mirror root.
pub fn normalize_asset_path(referrer: &str, reference: &str) -> Option<String> {
    let reference = reference
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim();

    let mut segments: Vec<&str> = if reference.starts_with('/') {
        Vec::new()
    } else {
        let mut parent = referrer.split('/').collect::<Vec<_>>();
        parent.pop();
        parent.retain(|segment| !segment.is_empty() && *segment != ".");
        parent
    };

    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}
