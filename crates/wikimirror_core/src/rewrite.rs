use std::collections::{BTreeMap, BTreeSet};

use crate::resolve::{DiscoveredResource, PathBucket};

/// Order substitution keys so that no key is replaced before a longer key it
/// is a prefix of: descending length, ties broken lexically.
pub fn substitution_order<'a, I>(keys: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut keys = keys.into_iter().collect::<Vec<_>>();
    keys.sort_by(|left, right| right.len().cmp(&left.len()).then(left.cmp(right)));
    keys.dedup();
    keys
}

/// Rewrite one mirrored text body: scrub removal markers, point every
/// discovered URL at its local path (relative to `referrer`'s directory),
/// and keep in-page anchors working.
pub fn rewrite_body(
    body: &str,
    removals: &BTreeSet<String>,
    resources: &BTreeMap<String, DiscoveredResource>,
    referrer: PathBucket,
) -> String {
    let mut output = body.to_string();

    for marker in substitution_order(removals.iter().map(String::as_str)) {
        output = output.replace(marker, "");
    }

    for url in substitution_order(resources.keys().map(String::as_str)) {
        if let Some(resource) = resources.get(url) {
            output = output.replace(url, &resource.reference_from(referrer));
        }
    }

    output.replace("href=\"/#", "href=\"#")
}

/// Whether a body can be treated as text and rewritten. Binary assets are
/// mirrored byte for byte.
pub fn is_text_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/")
        || lower.contains("javascript")
        || lower.contains("svg")
        || lower.contains("json")
        || lower.contains("xml")
}
