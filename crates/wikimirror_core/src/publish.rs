use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::UploadError;
use crate::ledger::{UploadLedger, compute_file_hash};
use crate::mirror::local_file_path;
use crate::platform::{UploadRequest, WikiPlatform};
use crate::resolve::PathBucket;
use crate::rewrite::substitution_order;
use crate::transform::{TransformOptions, TransformedDocument, passthrough, transform_page};
use crate::upload::{AssetOutcome, UploadCache, normalize_asset_path};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub project_path: PathBuf,
    pub team: String,
    pub mathjax_url: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedFile {
    pub local_path: String,
    pub remote: String,
    pub bucket: PathBucket,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssetCounts {
    pub uploaded: usize,
    pub cached: usize,
    pub already_on_platform: usize,
    pub from_ledger: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub transformed: usize,
    pub assets: AssetCounts,
    pub published: Vec<PublishedFile>,
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
    pub request_count: usize,
}

/// Transform result for one mirror file, before asset substitution.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedFile {
    pub local_path: String,
    pub bucket: PathBucket,
    pub document: TransformedDocument,
}

/// Run the pure transform over every page and stylesheet of a mirror.
/// Scripts and assets are left untouched.
pub fn prepare_mirror(project_path: &Path, options: &TransformOptions) -> Result<Vec<PreparedFile>> {
    let mut prepared = Vec::new();
    for local_path in collect_mirror_files(project_path)? {
        let bucket = PathBucket::from_file_name(&local_path);
        let document = match bucket {
            PathBucket::Page => transform_page(&read_text(project_path, &local_path)?, options),
            PathBucket::Stylesheet => passthrough(&read_text(project_path, &local_path)?),
            PathBucket::Script | PathBucket::Asset => continue,
        };
        prepared.push(PreparedFile {
            local_path,
            bucket,
            document,
        });
    }
    Ok(prepared)
}

/// Transform the mirror, upload every referenced asset once, write the
/// final content back and publish all pages, stylesheets and scripts.
///
/// Unknown upload errors are collected into the report and the run goes on;
/// an upload without a session aborts immediately.
pub fn run_migration<P: WikiPlatform + ?Sized>(
    options: &MigrationOptions,
    platform: &mut P,
    cache: &mut UploadCache,
    ledger: Option<&UploadLedger>,
) -> Result<MigrationReport> {
    let project_path = options.project_path.as_path();
    let transform_options = TransformOptions {
        team: options.team.clone(),
        mathjax_url: options.mathjax_url.clone(),
    };
    let prepared = prepare_mirror(project_path, &transform_options)?;
    let transformed = prepared
        .iter()
        .filter(|file| file.bucket == PathBucket::Page)
        .count();

    let mut assets = AssetCounts::default();
    let mut errors = Vec::new();

    for file in &prepared {
        let mut substitutions = BTreeMap::new();
        for reference in &file.document.asset_refs {
            let Some(key) = normalize_asset_path(&file.local_path, reference) else {
                warn!("{}: asset reference {reference} leaves the mirror", file.local_path);
                continue;
            };
            match resolve_asset(platform, cache, ledger, project_path, &key, options.force, &mut assets) {
                Ok(remote_url) => {
                    substitutions.insert(reference.as_str(), remote_url);
                }
                Err(UploadError::NotLoggedIn) => {
                    bail!("cannot upload {key}: {}", UploadError::NotLoggedIn)
                }
                Err(error) => {
                    warn!("failed to upload {key}: {error}");
                    errors.push(format!("{}: {key}: {error}", file.local_path));
                }
            }
        }

        let mut content = file.document.content.clone();
        for reference in substitution_order(substitutions.keys().copied()) {
            if let Some(remote_url) = substitutions.get(reference) {
                content = content.replace(reference, remote_url);
            }
        }
        let target = local_file_path(project_path, &file.local_path);
        fs::write(&target, content).with_context(|| format!("failed to write {}", target.display()))?;
    }
    info!("asset upload done: {} uploaded, {} cached", assets.uploaded, assets.cached);

    let mut published = Vec::new();
    let mut skipped = Vec::new();
    for local_path in collect_mirror_files(project_path)? {
        let bucket = PathBucket::from_file_name(&local_path);
        if bucket == PathBucket::Asset {
            continue;
        }
        let target = local_file_path(project_path, &local_path);
        let request = UploadRequest {
            local_path: &target,
            namespace_offset: bucket.directory().unwrap_or_default(),
            is_asset: false,
            force: options.force,
        };
        match platform.upload(&request) {
            Ok(remote) => {
                info!("published {local_path} -> {remote}");
                published.push(PublishedFile {
                    local_path,
                    remote,
                    bucket,
                });
            }
            Err(UploadError::NotLoggedIn) => {
                bail!("cannot publish {local_path}: {}", UploadError::NotLoggedIn)
            }
            Err(error) if error.memoized_remote().is_some() => {
                info!("skipping {local_path}: {error}");
                skipped.push(local_path);
            }
            Err(error) => {
                warn!("failed to publish {local_path}: {error}");
                errors.push(format!("{local_path}: {error}"));
            }
        }
    }

    Ok(MigrationReport {
        success: errors.is_empty(),
        transformed,
        assets,
        published,
        skipped,
        errors,
        request_count: platform.request_count(),
    })
}

fn resolve_asset<P: WikiPlatform + ?Sized>(
    platform: &mut P,
    cache: &mut UploadCache,
    ledger: Option<&UploadLedger>,
    project_path: &Path,
    key: &str,
    force: bool,
    counts: &mut AssetCounts,
) -> Result<String, UploadError> {
    if let Some(remote_url) = cache.get(key) {
        counts.cached += 1;
        return Ok(remote_url.to_string());
    }

    let content_hash = match ledger {
        Some(_) => Some(compute_file_hash(&local_file_path(project_path, key))?),
        None => None,
    };
    if let (Some(ledger), Some(hash)) = (ledger, content_hash.as_deref())
        && !force
        && let Some(remote_url) = ledger.lookup(key, hash)?
    {
        info!("{key} unchanged since last run, reusing {remote_url}");
        cache.insert(key, remote_url.clone());
        counts.from_ledger += 1;
        return Ok(remote_url);
    }

    let resolution = cache.resolve(platform, project_path, key, force)?;
    match resolution.outcome {
        AssetOutcome::Uploaded => counts.uploaded += 1,
        AssetOutcome::AlreadyOnPlatform => counts.already_on_platform += 1,
        AssetOutcome::Cached => counts.cached += 1,
    }
    if let (Some(ledger), Some(hash)) = (ledger, content_hash.as_deref()) {
        ledger.record(key, hash, &resolution.remote_url)?;
    }
    Ok(resolution.remote_url)
}

/// Every file below `project_path`, as sorted forward-slash relative paths.
pub fn collect_mirror_files(project_path: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(project_path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", project_path.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(project_path)
            .with_context(|| format!("{} is outside the mirror", entry.path().display()))?;
        files.push(relative.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

fn read_text(project_path: &Path, local_path: &str) -> Result<String> {
    let path = local_file_path(project_path, local_path);
    let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
