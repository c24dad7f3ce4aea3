use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::config::MirrorConfig;
use crate::error::UploadError;
use crate::platform::{
    UploadRequest, WikiPlatform, asset_title, page_title, team_namespace, team_path_title,
};

const EDIT_SUMMARY: &str = "wikimirror upload";
const PURGE_SUMMARY: &str = "wikimirror purge";

#[derive(Debug, Clone)]
pub struct MediaWikiPlatformConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
    pub team: String,
    pub offset: String,
}

impl MediaWikiPlatformConfig {
    pub fn from_config(config: &MirrorConfig, year: u32, team: &str, offset: &str) -> Self {
        Self {
            api_url: config.api_url(year),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_secs().saturating_mul(1_000),
            rate_limit_read_ms: env_value_u64("WIKIMIRROR_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKIMIRROR_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKIMIRROR_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKIMIRROR_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKIMIRROR_HTTP_RETRY_DELAY_MS", 500),
            team: team.to_string(),
            offset: offset.trim_matches('/').to_string(),
        }
    }
}

pub struct MediaWikiPlatform {
    client: Client,
    config: MediaWikiPlatformConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    logged_in: bool,
    uploaded: BTreeMap<PathBuf, String>,
}

impl MediaWikiPlatform {
    pub fn new(config: MediaWikiPlatformConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            logged_in: false,
            uploaded: BTreeMap::new(),
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid platform API URL: {}", self.config.api_url))?;
        let pairs = api_pairs(params, EmptyValues::Skip);

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, false);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    return check_api_error(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_json_post(
        &mut self,
        params: &[(&str, String)],
        is_write: bool,
        empty: EmptyValues,
    ) -> Result<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let pairs = api_pairs(params, empty);

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    return check_api_error(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    /// Multipart bodies are consumed by sending, so uploads are not retried.
    fn request_multipart(&mut self, form: Form) -> Result<Value> {
        self.apply_rate_limit(true);
        let response = self
            .client
            .post(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .multipart(form)
            .send()
            .context("failed to call MediaWiki upload API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki upload failed with HTTP {status}");
        }
        response
            .json()
            .context("failed to decode MediaWiki upload response")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn edit_page(&mut self, title: &str, content: &str, summary: &str) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        // An empty `text` blanks the page, so it must reach the API.
        let response = self.request_json_post(
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("token", token),
                ("text", content.to_string()),
            ],
            true,
            EmptyValues::Keep,
        )?;
        let payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let edit = payload
            .edit
            .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
        if edit.result.as_deref() != Some("Success") {
            bail!(
                "MediaWiki edit failed for {}: {}",
                title,
                edit.result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }

    fn publish_text(&mut self, request: &UploadRequest<'_>) -> Result<String> {
        let file_name = file_name_of(request.local_path)?;
        let content = fs::read_to_string(request.local_path)
            .with_context(|| format!("failed to read {}", request.local_path.display()))?;
        let offset = self.config.offset.clone();
        let title = page_title(
            &self.config.team,
            &[offset.as_str(), request.namespace_offset],
            &file_name,
        );
        self.edit_page(&title, &content, EDIT_SUMMARY)?;
        Ok(title)
    }

    fn upload_asset(&mut self, request: &UploadRequest<'_>) -> Result<String, UploadError> {
        let file_name = file_name_of(request.local_path)?;
        let title = asset_title(&self.config.team, &file_name);
        let remote_name = title.trim_start_matches("File:").to_string();
        let bytes = fs::read(request.local_path)
            .with_context(|| format!("failed to read {}", request.local_path.display()))?;
        let token = self.ensure_csrf_token()?;

        let mut form = Form::new()
            .text("action", "upload")
            .text("format", "json")
            .text("formatversion", "2")
            .text("filename", remote_name.clone())
            .text("comment", EDIT_SUMMARY)
            .text("token", token)
            .part("file", Part::bytes(bytes).file_name(remote_name));
        if request.force {
            form = form.text("ignorewarnings", "1");
        }

        let payload = self.request_multipart(form)?;
        classify_upload_response(&payload, &title)
    }
}

impl WikiPlatform for MediaWikiPlatform {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
            EmptyValues::Skip,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                self.logged_in = true;
                info!("logged in as {username}");
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn logout(&mut self) -> Result<()> {
        if !self.logged_in {
            return Ok(());
        }
        let token = self.ensure_csrf_token()?;
        self.request_json_post(
            &[("action", "logout".to_string()), ("token", token)],
            true,
            EmptyValues::Skip,
        )?;
        self.logged_in = false;
        self.csrf_token = None;
        info!("logged out");
        Ok(())
    }

    fn upload(&mut self, request: &UploadRequest<'_>) -> Result<String, UploadError> {
        if !self.logged_in {
            return Err(UploadError::NotLoggedIn);
        }
        if let Some(remote) = self.uploaded.get(request.local_path) {
            return Err(UploadError::AlreadyUploadedInSession {
                remote: remote.clone(),
            });
        }
        let remote = if request.is_asset {
            self.upload_asset(request)?
        } else {
            self.publish_text(request)?
        };
        self.uploaded
            .insert(request.local_path.to_path_buf(), remote.clone());
        Ok(remote)
    }

    fn resolve_asset_url(&mut self, remote: &str) -> Result<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", remote.to_string()),
            ("prop", "imageinfo".to_string()),
            ("iiprop", "url".to_string()),
        ])?;
        let parsed: ImageInfoResponse = serde_json::from_value(response)
            .context("failed to decode imageinfo API response")?;
        parsed
            .query
            .pages
            .into_iter()
            .flat_map(|page| page.imageinfo)
            .find_map(|info| info.url)
            .ok_or_else(|| anyhow::anyhow!("no file URL returned for {remote}"))
    }

    fn redirect(&mut self, source: &str, target: &str) -> Result<()> {
        let source_title = team_path_title(&self.config.team, source);
        let target_title = team_path_title(&self.config.team, target);
        self.edit_page(
            &source_title,
            &format!("#REDIRECT [[{target_title}]]"),
            EDIT_SUMMARY,
        )
        .with_context(|| format!("failed to redirect {source_title} to {target_title}"))
    }

    fn list_pages(&mut self) -> Result<Vec<String>> {
        let offset = self.config.offset.clone();
        let prefix = team_namespace(&self.config.team, &[offset.as_str()]);
        let mut titles = Vec::new();
        let mut continue_offset: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "prefixsearch".to_string()),
                ("pssearch", prefix.clone()),
                ("pslimit", "max".to_string()),
            ];
            if let Some(value) = &continue_offset {
                params.push(("psoffset", value.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode prefixsearch API response")?;
            for item in parsed.query.prefixsearch {
                if item.title == prefix || item.title.starts_with(&format!("{prefix}/")) {
                    titles.push(item.title);
                } else {
                    debug!("ignoring {} outside {prefix}", item.title);
                }
            }

            continue_offset = parsed
                .continuation
                .and_then(|cont| cont.psoffset)
                .and_then(|value| {
                    value
                        .as_u64()
                        .map(|number| number.to_string())
                        .or_else(|| value.as_str().map(ToString::to_string))
                });
            if continue_offset.is_none() {
                break;
            }
        }

        titles.sort();
        titles.dedup();
        Ok(titles)
    }

    /// Blank the page; team accounts cannot delete.
    fn delete_page(&mut self, page: &str) -> Result<()> {
        self.edit_page(page, "", PURGE_SUMMARY)
            .with_context(|| format!("failed to blank {page}"))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn classify_upload_response(payload: &Value, title: &str) -> Result<String, UploadError> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        if code == "fileexists-no-change" {
            return Err(UploadError::FileAlreadyUploaded {
                remote: title.to_string(),
            });
        }
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(UploadError::Rejected {
            message: format!("[{code}] {info}"),
        });
    }

    let upload = payload.get("upload").ok_or_else(|| UploadError::Rejected {
        message: "missing upload payload in API response".to_string(),
    })?;
    match upload.get("result").and_then(Value::as_str) {
        Some("Success") => Ok(title.to_string()),
        Some("Warning") => {
            let warnings = upload.get("warnings").cloned().unwrap_or(Value::Null);
            if let Some(duplicate) = warnings
                .get("duplicate")
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(Value::as_str)
            {
                return Err(UploadError::FileAlreadyUploaded {
                    remote: format!("File:{duplicate}"),
                });
            }
            if warnings.get("exists").is_some() || warnings.get("nochange").is_some() {
                return Err(UploadError::FileAlreadyUploaded {
                    remote: title.to_string(),
                });
            }
            Err(UploadError::Rejected {
                message: format!("upload warnings for {title}: {warnings}"),
            })
        }
        other => Err(UploadError::Rejected {
            message: format!(
                "unexpected upload result for {title}: {}",
                other.unwrap_or("none")
            ),
        }),
    }
}

fn check_api_error(payload: Value) -> Result<Value> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(payload)
}

/// Whether parameters with an empty value are sent or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmptyValues {
    Skip,
    Keep,
}

fn api_pairs(params: &[(&str, String)], empty: EmptyValues) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if empty == EmptyValues::Keep || !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    prefixsearch: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    psoffset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct ImageInfoResponse {
    #[serde(default)]
    query: ImageInfoQuery,
}

#[derive(Debug, Deserialize, Default)]
struct ImageInfoQuery {
    #[serde(default)]
    pages: Vec<ImageInfoPage>,
}

#[derive(Debug, Deserialize)]
struct ImageInfoPage {
    #[serde(default)]
    imageinfo: Vec<ImageInfoItem>,
}

#[derive(Debug, Deserialize)]
struct ImageInfoItem {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
}
