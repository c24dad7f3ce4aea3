use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikimirror/0.2";
pub const DEFAULT_API_URL: &str = "https://{year}.igem.org/api.php";
pub const DEFAULT_WIKI_URL: &str = "https://{year}.igem.org";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub migration: MigrationSection,
    /// Font file name -> download URL.
    #[serde(default)]
    pub fonts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PlatformSection {
    pub api_url: Option<String>,
    pub wiki_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationSection {
    pub mathjax_url: Option<String>,
    /// Page names that get a redirect from their lowercase spelling.
    #[serde(default)]
    pub redirect_pages: Vec<String>,
    #[serde(default)]
    pub custom_redirects: BTreeMap<String, String>,
}

impl MirrorConfig {
    /// Resolve the platform API URL for `year`: env > config > default.
    pub fn api_url(&self, year: u32) -> String {
        let template = env_override("WIKIMIRROR_API_URL")
            .or_else(|| self.platform.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        expand_year(&template, year)
    }

    /// Resolve the browsable wiki URL for `year`: env > config > default.
    pub fn wiki_url(&self, year: u32) -> String {
        let template = env_override("WIKIMIRROR_WIKI_URL")
            .or_else(|| self.platform.wiki_url.clone())
            .unwrap_or_else(|| DEFAULT_WIKI_URL.to_string());
        expand_year(&template, year)
    }

    pub fn user_agent(&self) -> String {
        env_override("WIKIMIRROR_USER_AGENT")
            .or_else(|| self.platform.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_secs(&self) -> u64 {
        self.platform.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn mathjax_url(&self) -> Option<&str> {
        self.migration
            .mathjax_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Load and parse a MirrorConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    if !config_path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MirrorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn expand_year(template: &str, year: u32) -> String {
    template.replace("{year}", &year.to_string())
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
