use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use scraper::{Html, Selector};
use serde::Serialize;
use url::Url;

use crate::site::{absolute_url, is_same_domain};

pub const DEFAULT_CRAWL_USER_AGENT: &str = "wikimirror/0.2";

/// Element selectors whose attribute points at another resource of the site.
const LINK_SELECTORS: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("link[href]", "href"),
    ("script[src]", "src"),
    ("img[src]", "src"),
    ("video[src]", "src"),
    ("audio[src]", "src"),
];

const HEADER_STYLE_SELECTOR: &str = "header[style]";

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Single-resource GET used by both the crawl and the rewrite pass.
pub trait SiteFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedResponse>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub user_agent: String,
    pub insecure: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_CRAWL_USER_AGENT.to_string(),
            insecure: false,
        }
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(options: &FetchOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(options.user_agent.clone())
            .timeout(None)
            .danger_accept_invalid_certs(options.insecure)
            .build()
            .context("failed to build crawl HTTP client")?;
        Ok(Self { client })
    }
}

impl SiteFetcher for HttpFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?
            .to_vec();
        Ok(FetchedResponse {
            final_url,
            status,
            content_type,
            body,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlResult {
    /// Renderable resources keyed by final URL, with their content type.
    pub content_types: BTreeMap<String, String>,
    /// API echo responses (JSON/XML) to scrub from every page body.
    pub removals: BTreeSet<String>,
    pub fetched: usize,
    pub non_success: Vec<(String, u16)>,
}

/// Breadth-first walk over every same-domain resource reachable from
/// `entry`. Each URL is fetched at most once; a transport failure aborts the
/// whole crawl.
pub fn crawl_site<F: SiteFetcher>(entry: &str, domain: &str, fetcher: &mut F) -> Result<CrawlResult> {
    let entry = Url::parse(entry).with_context(|| format!("invalid entry url {entry}"))?;
    let selectors = LINK_SELECTORS
        .iter()
        .map(|(selector, attribute)| Ok((parse_selector(selector)?, *attribute)))
        .collect::<Result<Vec<_>>>()?;
    let header_selector = parse_selector(HEADER_STYLE_SELECTOR)?;

    let mut result = CrawlResult::default();
    let mut visited = HashSet::from([entry.to_string()]);
    let mut queue = VecDeque::from([entry]);

    while let Some(url) = queue.pop_front() {
        if is_recorded(&result, url.as_str()) {
            debug!("skipping {url}: already reached through a redirect");
            continue;
        }
        let response = fetcher.fetch(url.as_str())?;
        result.fetched += 1;

        if !response.is_success() {
            warn!("{} {}", response.status, url);
            result.non_success.push((url.to_string(), response.status));
            continue;
        }

        let final_url = Url::parse(&response.final_url).unwrap_or_else(|_| url.clone());
        visited.insert(final_url.to_string());
        if !is_same_domain(&final_url, domain) {
            debug!("skipping {url}: redirected off-site to {final_url}");
            continue;
        }
        if final_url != url && is_recorded(&result, final_url.as_str()) {
            debug!("skipping {url}: redirects to already crawled {final_url}");
            continue;
        }

        if is_removal_content_type(&response.content_type) {
            info!("removal marker: {final_url} ({})", response.content_type);
            result.removals.insert(final_url.to_string());
            continue;
        }

        info!("discovered: {final_url} ({})", response.content_type);
        result
            .content_types
            .insert(final_url.to_string(), response.content_type.clone());

        if !response.content_type.to_ascii_lowercase().contains("text/html") {
            continue;
        }

        let body = String::from_utf8_lossy(&response.body);
        for link in extract_links(&body, &final_url, &selectors, &header_selector) {
            if !is_same_domain(&link, domain) {
                debug!("skipping off-site link {link}");
                continue;
            }
            if visited.insert(link.to_string()) {
                queue.push_back(link);
            }
        }
    }

    Ok(result)
}

fn is_recorded(result: &CrawlResult, url: &str) -> bool {
    result.content_types.contains_key(url) || result.removals.contains(url)
}

/// JSON and XML responses are API echoes; SVG is XML but renders as an asset.
pub fn is_removal_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    if lower.contains("svg") {
        return false;
    }
    lower.contains("json") || lower.contains("xml")
}

fn extract_links(
    body: &str,
    base: &Url,
    selectors: &[(Selector, &str)],
    header_selector: &Selector,
) -> Vec<Url> {
    let document = Html::parse_document(body);
    let mut links = Vec::new();
    for (selector, attribute) in selectors {
        for element in document.select(selector) {
            if let Some(value) = element.value().attr(attribute)
                && let Some(link) = absolute_url(base, value)
            {
                links.push(link);
            }
        }
    }
    for element in document.select(header_selector) {
        if let Some(style) = element.value().attr("style")
            && let Some(path) = background_image_path(style)
            && let Some(link) = absolute_url(base, path)
        {
            links.push(link);
        }
    }
    links
}

/// Isolate the path inside `url(...)` of an inline style, without quotes or
/// surrounding CSS.
pub fn background_image_path(style: &str) -> Option<&str> {
    static STYLE_URL: OnceLock<Regex> = OnceLock::new();
    let regex = STYLE_URL.get_or_init(|| {
        Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).expect("valid style url regex")
    });
    regex
        .captures(style)
        .and_then(|captures| captures.get(1))
        .map(|path| path.as_str().trim())
        .filter(|path| !path.is_empty())
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|error| anyhow::anyhow!("invalid selector {selector}: {error:?}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use anyhow::bail;

    use super::{
        FetchedResponse, SiteFetcher, background_image_path, crawl_site, is_removal_content_type,
    };

    /// In-memory site: URL -> (status, content type, body).
    #[derive(Default)]
    pub(crate) struct MockSite {
        pub(crate) pages: BTreeMap<String, (u16, String, String)>,
        pub(crate) redirects: BTreeMap<String, String>,
        pub(crate) requests: Vec<String>,
    }

    impl MockSite {
        pub(crate) fn page(mut self, url: &str, content_type: &str, body: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                (200, content_type.to_string(), body.to_string()),
            );
            self
        }

        pub(crate) fn status(mut self, url: &str, status: u16) -> Self {
            self.pages
                .insert(url.to_string(), (status, "text/html".to_string(), String::new()));
            self
        }
    }

    impl SiteFetcher for MockSite {
        fn fetch(&mut self, url: &str) -> anyhow::Result<FetchedResponse> {
            self.requests.push(url.to_string());
            let target = self.redirects.get(url).cloned().unwrap_or_else(|| url.to_string());
            match self.pages.get(&target) {
                Some((status, content_type, body)) => Ok(FetchedResponse {
                    final_url: target,
                    status: *status,
                    content_type: content_type.clone(),
                    body: body.as_bytes().to_vec(),
                }),
                None => bail!("connection refused: {url}"),
            }
        }
    }

    #[test]
    fn crawl_terminates_on_cycles_and_fetches_each_url_once() {
        let mut site = MockSite::default()
            .page(
                "http://example.org/",
                "text/html",
                r#"<a href="/about">About</a><a href="http://example.org/">Home</a>"#,
            )
            .page(
                "http://example.org/about",
                "text/html",
                r#"<a href="/">Home</a><a href="/about#team">Team</a>"#,
            );

        let result = crawl_site("http://example.org/", "example.org", &mut site).expect("crawl");

        assert_eq!(site.requests.len(), 2);
        assert_eq!(result.content_types.len(), 2);
        assert!(result.content_types.contains_key("http://example.org/about"));
    }

    #[test]
    fn redirect_targets_are_not_fetched_again() {
        let mut site = MockSite::default()
            .page(
                "http://example.org/",
                "text/html",
                r#"<a href="/old-about">Old</a><a href="/about">About</a>"#,
            )
            .page("http://example.org/about", "text/html", "<p>about</p>");
        site.redirects.insert(
            "http://example.org/old-about".to_string(),
            "http://example.org/about".to_string(),
        );

        let result = crawl_site("http://example.org/", "example.org", &mut site).expect("crawl");

        assert_eq!(
            site.requests,
            vec!["http://example.org/", "http://example.org/old-about"]
        );
        assert_eq!(result.fetched, 2);
        assert!(result.content_types.contains_key("http://example.org/about"));
        assert!(!result.content_types.contains_key("http://example.org/old-about"));
    }

    #[test]
    fn crawl_follows_every_reference_kind_and_stays_on_domain() {
        let mut site = MockSite::default()
            .page(
                "http://example.org/",
                "text/html; charset=UTF-8",
                r#"<html><head>
                <link rel="stylesheet" href="/style.css">
                <script src="/app.js"></script>
                <script src="https://cdn.other.org/lib.js"></script>
                </head><body>
                <header style="background-image: url('/uploads/hero.jpg');"></header>
                <img src="/uploads/logo.png">
                <video src="/uploads/clip.mp4"></video>
                <audio src="/uploads/sound.mp3"></audio>
                <a href="mailto:team@example.org">Mail</a>
                </body></html>"#,
            )
            .page("http://example.org/style.css", "text/css", "body{}")
            .page("http://example.org/app.js", "application/javascript", "")
            .page("http://example.org/uploads/hero.jpg", "image/jpeg", "")
            .page("http://example.org/uploads/logo.png", "image/png", "")
            .page("http://example.org/uploads/clip.mp4", "video/mp4", "")
            .page("http://example.org/uploads/sound.mp3", "audio/mpeg", "");

        let result = crawl_site("http://example.org/", "example.org", &mut site).expect("crawl");

        assert_eq!(result.content_types.len(), 7);
        assert!(
            !site
                .requests
                .iter()
                .any(|request| request.contains("cdn.other.org"))
        );
        assert!(
            result
                .content_types
                .contains_key("http://example.org/uploads/hero.jpg")
        );
    }

    #[test]
    fn json_and_xml_become_removal_markers_but_svg_does_not() {
        let mut site = MockSite::default()
            .page(
                "http://example.org/",
                "text/html",
                r#"<link rel="alternate" href="/wp-json/"><link href="/xmlrpc.php"><img src="/logo.svg">"#,
            )
            .page("http://example.org/wp-json/", "application/json", "{}")
            .page("http://example.org/xmlrpc.php", "text/xml", "<xml/>")
            .page("http://example.org/logo.svg", "image/svg+xml", "<svg/>");

        let result = crawl_site("http://example.org/", "example.org", &mut site).expect("crawl");

        assert_eq!(result.removals.len(), 2);
        assert!(result.removals.contains("http://example.org/wp-json/"));
        assert!(result.content_types.contains_key("http://example.org/logo.svg"));
    }

    #[test]
    fn non_success_responses_are_recorded_without_aborting() {
        let mut site = MockSite::default()
            .page(
                "http://example.org/",
                "text/html",
                r#"<a href="/missing">x</a><a href="/ok">y</a>"#,
            )
            .status("http://example.org/missing", 404)
            .page("http://example.org/ok", "text/html", "ok");

        let result = crawl_site("http://example.org/", "example.org", &mut site).expect("crawl");

        assert_eq!(
            result.non_success,
            vec![("http://example.org/missing".to_string(), 404)]
        );
        assert!(result.content_types.contains_key("http://example.org/ok"));
        assert!(!result.content_types.contains_key("http://example.org/missing"));
    }

    #[test]
    fn transport_failure_aborts_the_crawl() {
        let mut site = MockSite::default().page(
            "http://example.org/",
            "text/html",
            r#"<a href="/unreachable">x</a>"#,
        );
        let error = crawl_site("http://example.org/", "example.org", &mut site)
            .expect_err("must fail");
        assert!(error.to_string().contains("connection refused"));
    }

    #[test]
    fn resources_are_keyed_by_final_url() {
        let mut site = MockSite::default()
            .page("http://example.org/", "text/html", r#"<a href="/old">x</a>"#)
            .page("http://example.org/new/", "text/html", "moved");
        site.redirects.insert(
            "http://example.org/old".to_string(),
            "http://example.org/new/".to_string(),
        );

        let result = crawl_site("http://example.org/", "example.org", &mut site).expect("crawl");

        assert!(result.content_types.contains_key("http://example.org/new/"));
        assert!(!result.content_types.contains_key("http://example.org/old"));
    }

    #[test]
    fn background_image_path_isolates_url_contents() {
        assert_eq!(
            background_image_path("background-image: url('/uploads/hero.jpg');"),
            Some("/uploads/hero.jpg")
        );
        assert_eq!(
            background_image_path("color: red; background: url(\"/a b.png\") no-repeat;"),
            Some("/a b.png")
        );
        assert_eq!(background_image_path("background:url(/x.png)"), Some("/x.png"));
        assert_eq!(background_image_path("color: red;"), None);
    }

    #[test]
    fn removal_content_types() {
        assert!(is_removal_content_type("application/json; charset=UTF-8"));
        assert!(is_removal_content_type("application/rss+xml"));
        assert!(!is_removal_content_type("image/svg+xml"));
        assert!(!is_removal_content_type("text/html"));
    }
}
