//! Markup adaptation for the target wiki.
//!
//! The wiki serves every uploaded text file as a page, so scripts and
//! stylesheets are only usable through its raw-content endpoint with an
//! explicit `ctype`. Assets get a single randomized URL each, so anything
//! that depends on predictable asset paths (responsive variants) is dropped.
//! Everything here is pure string work; uploading happens in `upload`.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

pub const CSS_RAW_SUFFIX: &str = "?action=raw&ctype=text/css";
pub const JS_RAW_SUFFIX: &str = "?action=raw&ctype=text/javascript";

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub team: String,
    pub mathjax_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformedDocument {
    pub content: String,
    /// Distinct references into the assets bucket, in first-seen order.
    pub asset_refs: Vec<String>,
}

/// Run every markup pass over one page, in dependency order.
pub fn transform_page(content: &str, options: &TransformOptions) -> TransformedDocument {
    let mut output = remove_empty_links(content);
    output = remove_objects(&output);
    output = remove_remove_links(&output);
    output = replace_doctype(&output, &options.team);
    output = remove_srcset(&output);
    output = remove_inline_legacy_blocks(&output);
    output = rewrite_extensions(&output);
    if let Some(url) = options.mathjax_url.as_deref() {
        output = insert_mathjax(&output, url);
    }
    let asset_refs = find_asset_refs(&output);
    TransformedDocument {
        content: output,
        asset_refs,
    }
}

/// Stylesheets are published as-is; only their asset references matter.
pub fn passthrough(content: &str) -> TransformedDocument {
    TransformedDocument {
        content: content.to_string(),
        asset_refs: find_asset_refs(content),
    }
}

/// Tags carrying `href=""` are leftovers of the source CMS's APIs.
pub fn remove_empty_links(content: &str) -> String {
    pattern(&EMPTY_HREF, r#"<[^<>]*?href=""[^<>]*?>"#)
        .replace_all(content, "")
        .into_owned()
}

pub fn remove_objects(content: &str) -> String {
    pattern(&OBJECT_BLOCK, r"(?is)<object\b.*?</object>")
        .replace_all(content, "")
        .into_owned()
}

pub fn remove_remove_links(content: &str) -> String {
    pattern(&REMOVE_LINK, r#"(?s)<a class="remove" .*?</a>"#)
        .replace_all(content, "")
        .into_owned()
}

/// The wiki prepends its own document head through the team template.
pub fn replace_doctype(content: &str, team: &str) -> String {
    let template = format!("{{{{{team}}}}}");
    content
        .replacen("<!DOCTYPE html>", &template, 1)
        .replacen("<!doctype html>", &template, 1)
}

pub fn remove_srcset(content: &str) -> String {
    let output = pattern(&SRCSET, r#"srcset=".*?""#).replace_all(content, "");
    pattern(&SIZES, r#"sizes=".*?""#)
        .replace_all(&output, "")
        .into_owned()
}

/// Drops the inline emoji/script+style block the source CMS injects, which
/// opens with a bare `<script>` and closes with `</style>`.
pub fn remove_inline_legacy_blocks(content: &str) -> String {
    pattern(&INLINE_LEGACY, r"(?s)<script>.*?</style>")
        .replace_all(content, "")
        .into_owned()
}

/// Point local stylesheet/script references at the raw-content endpoint and
/// address pages by bare name. Absolute URLs (anything with a scheme) are
/// left alone.
pub fn rewrite_extensions(content: &str) -> String {
    let min_css = pattern(
        &MIN_CSS_REF,
        r#"((?:href|src)=["'][^"':]*?)\.min\.css(?:\?[^"']*)?(["'])"#,
    );
    let css = pattern(&CSS_REF, r#"((?:href|src)=["'][^"':]*?)\.css(?:\?[^"']*)?(["'])"#);
    let min_js = pattern(
        &MIN_JS_REF,
        r#"((?:href|src)=["'][^"':]*?)\.min\.js(?:\?[^"']*)?(["'])"#,
    );
    let js = pattern(&JS_REF, r#"((?:href|src)=["'][^"':]*?)\.js(?:\?[^"']*)?(["'])"#);

    let output = min_css.replace_all(content, format!("${{1}}-min{CSS_RAW_SUFFIX}${{2}}").as_str());
    let output = css.replace_all(&output, format!("${{1}}{CSS_RAW_SUFFIX}${{2}}").as_str());
    let output = min_js.replace_all(&output, format!("${{1}}-min{JS_RAW_SUFFIX}${{2}}").as_str());
    let output = js.replace_all(&output, format!("${{1}}{JS_RAW_SUFFIX}${{2}}").as_str());
    output.replace("index.html", "").replace(".html", "")
}

pub fn insert_mathjax(content: &str, mathjax_url: &str) -> String {
    let tag = format!(r#"<script type="text/javascript" async src="{mathjax_url}"></script>"#);
    pattern(&MATHJAX, r"(?i)<!--\s*mathjax\s*-->")
        .replace_all(content, regex::NoExpand(&tag))
        .into_owned()
}

/// Every `src="..."` and CSS `url(...)` target that lives in the assets
/// bucket, deduplicated in first-seen order.
pub fn find_asset_refs(content: &str) -> Vec<String> {
    let src = pattern(&SRC_ATTR, r#"src=["']([^"']*?)["']"#);
    let css_url = pattern(&CSS_URL, r#"url\(\s*['"]?([^'")]*?)['"]?\s*\)"#);

    let mut refs: Vec<String> = Vec::new();
    let candidates = src
        .captures_iter(content)
        .chain(css_url.captures_iter(content))
        .filter_map(|captures| captures.get(1).map(|value| value.as_str().trim()));
    for candidate in candidates {
        if is_asset_ref(candidate) && !refs.iter().any(|existing| existing == candidate) {
            refs.push(candidate.to_string());
        }
    }
    refs
}

fn is_asset_ref(reference: &str) -> bool {
    !reference.contains("://")
        && reference
            .split('/')
            .any(|segment| segment == "assets")
}

static EMPTY_HREF: OnceLock<Regex> = OnceLock::new();
static OBJECT_BLOCK: OnceLock<Regex> = OnceLock::new();
static REMOVE_LINK: OnceLock<Regex> = OnceLock::new();
static SRCSET: OnceLock<Regex> = OnceLock::new();
static SIZES: OnceLock<Regex> = OnceLock::new();
static INLINE_LEGACY: OnceLock<Regex> = OnceLock::new();
static MIN_CSS_REF: OnceLock<Regex> = OnceLock::new();
static CSS_REF: OnceLock<Regex> = OnceLock::new();
static MIN_JS_REF: OnceLock<Regex> = OnceLock::new();
static JS_REF: OnceLock<Regex> = OnceLock::new();
static MATHJAX: OnceLock<Regex> = OnceLock::new();
static SRC_ATTR: OnceLock<Regex> = OnceLock::new();
static CSS_URL: OnceLock<Regex> = OnceLock::new();

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("transform patterns are valid"))
}
