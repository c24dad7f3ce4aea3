use std::collections::BTreeMap;

use log::warn;
use serde::Serialize;

/// Resource kind, decided by the response content type alone. Drives the
/// directory a resource lands in locally and its namespace offset remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathBucket {
    Page,
    Stylesheet,
    Script,
    Asset,
}

impl PathBucket {
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("text/html") {
            Self::Page
        } else if content_type.contains("text/css") {
            Self::Stylesheet
        } else if content_type.contains("javascript") {
            Self::Script
        } else {
            Self::Asset
        }
    }

    /// Classify a file already on disk by its extension.
    pub fn from_file_name(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".html") || lower.ends_with(".htm") {
            Self::Page
        } else if lower.ends_with(".css") {
            Self::Stylesheet
        } else if lower.ends_with(".js") {
            Self::Script
        } else {
            Self::Asset
        }
    }

    pub fn directory(self) -> Option<&'static str> {
        match self {
            Self::Page => None,
            Self::Stylesheet => Some("css"),
            Self::Script => Some("js"),
            Self::Asset => Some("assets"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Stylesheet => "stylesheet",
            Self::Script => "script",
            Self::Asset => "asset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredResource {
    pub url: String,
    pub content_type: String,
    pub bucket: PathBucket,
    /// Path relative to the mirror root, always with forward slashes.
    pub local_path: String,
}

impl DiscoveredResource {
    /// How a file in `referrer`'s bucket refers to this resource.
    pub fn reference_from(&self, referrer: PathBucket) -> String {
        match referrer.directory() {
            None => format!("./{}", self.local_path),
            Some(_) => format!("./../{}", self.local_path),
        }
    }
}

pub fn resolve_local_path(url: &str, content_type: &str, domain: &str) -> String {
    let bucket = PathBucket::from_content_type(content_type);
    let last = last_segment(url);
    match bucket {
        PathBucket::Page => {
            let file_name = format!("{last}.html");
            if file_name.contains(domain) {
                "index.html".to_string()
            } else {
                file_name
            }
        }
        PathBucket::Stylesheet | PathBucket::Script | PathBucket::Asset => {
            let name = last.split(['?', '#']).next().unwrap_or_default();
            format!("{}/{name}", bucket.directory().unwrap_or_default())
        }
    }
}

/// Assign every crawled URL its local path. Two URLs landing on the same
/// path are reported and the later one (in URL order) wins.
pub fn resolve_resources(
    content_types: &BTreeMap<String, String>,
    domain: &str,
) -> BTreeMap<String, DiscoveredResource> {
    let mut claimed: BTreeMap<String, String> = BTreeMap::new();
    let mut resources = BTreeMap::new();
    for (url, content_type) in content_types {
        let local_path = resolve_local_path(url, content_type, domain);
        if let Some(previous) = claimed.insert(local_path.clone(), url.clone()) {
            warn!("path collision on {local_path}: {previous} is overwritten by {url}");
        }
        resources.insert(
            url.clone(),
            DiscoveredResource {
                url: url.clone(),
                content_type: content_type.clone(),
                bucket: PathBucket::from_content_type(content_type),
                local_path,
            },
        );
    }
    resources
}

fn last_segment(url: &str) -> &str {
    url.split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .unwrap_or_default()
}
