use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::info;
use serde::Serialize;

use crate::crawl::{SiteFetcher, crawl_site};
use crate::resolve::{DiscoveredResource, resolve_resources};
use crate::rewrite::{is_text_content_type, rewrite_body};
use crate::site::{sanitize_url, url_to_domain};

/// Bucket directories created before any file is written.
pub const PROJECT_DIRS: &[&str] = &["css", "js", "assets", "fonts"];

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub entry_url: String,
    /// Parent directory; the mirror lands in `<output_dir>/<domain>/`.
    pub output_dir: PathBuf,
    /// Font file name -> URL, downloaded into `fonts/`.
    pub fonts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    pub project_path: PathBuf,
    pub domain: String,
    pub fetched: usize,
    pub resources: Vec<DiscoveredResource>,
    pub removals: BTreeSet<String>,
    pub written: usize,
    pub fonts: usize,
    pub non_success: Vec<(String, u16)>,
}

/// Crawl the site behind `options.entry_url` and write a self-contained
/// mirror of it. Any fetch or write failure aborts the stage.
pub fn mirror_site<F: SiteFetcher>(options: &MirrorOptions, fetcher: &mut F) -> Result<MirrorReport> {
    let entry_url = sanitize_url(&options.entry_url);
    let domain = url_to_domain(&entry_url)?;
    let project_path = create_project(&options.output_dir, &domain)?;
    info!("mirroring {entry_url} into {}", project_path.display());

    let crawl = crawl_site(&entry_url, &domain, fetcher)?;
    let resources = resolve_resources(&crawl.content_types, &domain);

    let mut written = 0usize;
    for resource in resources.values() {
        let response = fetcher.fetch(&resource.url)?;
        if !response.is_success() {
            bail!(
                "refetch of {} failed with HTTP {}",
                resource.url,
                response.status
            );
        }
        let contents = if is_text_content_type(&resource.content_type) {
            let body = String::from_utf8_lossy(&response.body);
            rewrite_body(&body, &crawl.removals, &resources, resource.bucket).into_bytes()
        } else {
            response.body
        };
        let target = local_file_path(&project_path, &resource.local_path);
        write_mirror_file(&target, &contents)?;
        info!("wrote {} ({})", resource.local_path, resource.url);
        written += 1;
    }

    let fonts = download_fonts(&project_path, &options.fonts, fetcher)?;

    Ok(MirrorReport {
        project_path,
        domain,
        fetched: crawl.fetched,
        resources: resources.into_values().collect(),
        removals: crawl.removals,
        written,
        fonts,
        non_success: crawl.non_success,
    })
}

/// Create `<parent>/<domain>/` with its bucket directories. An empty
/// `parent` means the current directory.
pub fn create_project(parent: &Path, domain: &str) -> Result<PathBuf> {
    let project_path = parent.join(domain);
    for dir in PROJECT_DIRS {
        let path = project_path.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    Ok(project_path)
}

pub fn local_file_path(project_path: &Path, relative: &str) -> PathBuf {
    let mut output = project_path.to_path_buf();
    for segment in relative.split('/') {
        if !segment.is_empty() && segment != "." {
            output.push(segment);
        }
    }
    output
}

fn download_fonts<F: SiteFetcher>(
    project_path: &Path,
    fonts: &BTreeMap<String, String>,
    fetcher: &mut F,
) -> Result<usize> {
    for (name, url) in fonts {
        let response = fetcher.fetch(url)?;
        if !response.is_success() {
            bail!("font {name} could not be fetched from {url}: HTTP {}", response.status);
        }
        let target = project_path.join("fonts").join(name);
        write_mirror_file(&target, &response.body)?;
        info!("wrote font {name}");
    }
    Ok(fonts.len())
}

fn write_mirror_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{MirrorOptions, create_project, mirror_site};
    use crate::crawl::tests::MockSite;
    use crate::error::UrlError;

    fn sample_site() -> MockSite {
        let nav = r#"<link rel="stylesheet" href="http://example.org/style.css?ver=2">
<a href="http://example.org/">Home</a>
<a href="http://example.org/about">About</a>
<a href="http://example.org/contact">Contact</a>"#;
        MockSite::default()
            .page(
                "http://example.org/",
                "text/html; charset=UTF-8",
                &format!("<!DOCTYPE html><html><head>{nav}</head><body><img src=\"/logo.png\"></body></html>"),
            )
            .page("http://example.org/about", "text/html", &format!("<html>{nav}</html>"))
            .page("http://example.org/contact", "text/html", &format!("<html>{nav}</html>"))
            .page(
                "http://example.org/style.css?ver=2",
                "text/css",
                "body { background: url(http://example.org/logo.png); }",
            )
            .page("http://example.org/logo.png", "image/png", "\u{89}PNG")
    }

    #[test]
    fn mirror_writes_the_expected_tree() {
        let temp = tempdir().expect("tempdir");
        let mut site = sample_site();

        let report = mirror_site(
            &MirrorOptions {
                entry_url: "http://example.org".to_string(),
                output_dir: temp.path().to_path_buf(),
                fonts: BTreeMap::new(),
            },
            &mut site,
        )
        .expect("mirror");

        let root = temp.path().join("example.org");
        assert_eq!(report.project_path, root);
        assert_eq!(report.written, 5);
        for file in ["index.html", "about.html", "contact.html", "css/style.css", "assets/logo.png"] {
            assert!(root.join(file).exists(), "missing {file}");
        }
        assert!(root.join("fonts").is_dir());
        assert!(root.join("js").is_dir());

        let index = fs::read_to_string(root.join("index.html")).expect("read index");
        assert!(index.contains(r#"href="./css/style.css""#));
        assert!(index.contains(r#"href="./about.html""#));
        assert!(index.contains(r#"href="./index.html""#));
        assert!(!index.contains("http://example.org"));

        let about = fs::read_to_string(root.join("about.html")).expect("read about");
        assert!(about.contains(r#"href="./css/style.css""#));

        let css = fs::read_to_string(root.join("css").join("style.css")).expect("read css");
        assert_eq!(css, "body { background: url(./../assets/logo.png); }");
    }

    #[test]
    fn mirror_downloads_configured_fonts() {
        let temp = tempdir().expect("tempdir");
        let mut site = MockSite::default()
            .page("http://example.org/", "text/html", "<p>hi</p>")
            .page("http://fonts.example.net/inter.woff2", "font/woff2", "wOF2");

        let report = mirror_site(
            &MirrorOptions {
                entry_url: "http://example.org/".to_string(),
                output_dir: temp.path().to_path_buf(),
                fonts: BTreeMap::from([(
                    "inter.woff2".to_string(),
                    "http://fonts.example.net/inter.woff2".to_string(),
                )]),
            },
            &mut site,
        )
        .expect("mirror");

        assert_eq!(report.fonts, 1);
        let font = fs::read(temp.path().join("example.org").join("fonts").join("inter.woff2"))
            .expect("read font");
        assert_eq!(font, b"wOF2");
    }

    #[test]
    fn mirror_rejects_invalid_entry_urls_before_crawling() {
        let temp = tempdir().expect("tempdir");
        let mut site = MockSite::default();

        let error = mirror_site(
            &MirrorOptions {
                entry_url: "http://example.org:8080/".to_string(),
                output_dir: temp.path().to_path_buf(),
                fonts: BTreeMap::new(),
            },
            &mut site,
        )
        .expect_err("must fail");

        assert!(matches!(
            error.downcast_ref::<UrlError>(),
            Some(UrlError::UnsupportedPortSpecifier(_))
        ));
        assert!(site.requests.is_empty());
    }

    #[test]
    fn create_project_precreates_bucket_dirs() {
        let temp = tempdir().expect("tempdir");
        let root = create_project(temp.path(), "example.org").expect("create");
        for dir in ["css", "js", "assets", "fonts"] {
            assert!(root.join(dir).is_dir());
        }
    }
}
