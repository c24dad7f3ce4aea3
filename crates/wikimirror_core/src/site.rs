use url::Url;

use crate::error::UrlError;

/// Trim query, fragment and parameter noise from an entry URL. A bare
/// `scheme://host` gains a trailing slash so it names the site root.
pub fn sanitize_url(url: &str) -> String {
    let mut output = url.trim();
    for separator in ['?', '#', '&', '='] {
        if let Some(index) = output.find(separator) {
            output = &output[..index];
        }
    }
    let mut output = output.to_string();
    let segments = output.split('/').filter(|segment| !segment.is_empty()).count();
    if segments == 2 && !output.ends_with('/') {
        output.push('/');
    }
    output
}

/// Extract the bare domain from an absolute URL.
///
/// Ports are rejected rather than stripped, since every local path and
/// allowed-domain check is keyed by the host alone.
pub fn url_to_domain(url: &str) -> Result<String, UrlError> {
    let parts = url.split(':').collect::<Vec<_>>();
    if parts.len() == 1 || !parts[0].contains("http") {
        return Err(UrlError::NoProtocolInformation(url.to_string()));
    }
    if parts.len() > 2 {
        return Err(UrlError::UnsupportedPortSpecifier(url.to_string()));
    }
    let segments = parts[1].split('/').collect::<Vec<_>>();
    if segments.len() < 3 || segments[2].is_empty() {
        return Err(UrlError::MalformedUrl(url.to_string()));
    }
    Ok(segments[2].to_string())
}

/// Resolve `href` against the page it was found on. Fragments are dropped so
/// in-page anchors never count as distinct resources; non-fetchable schemes
/// yield `None`.
pub fn absolute_url(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

pub fn is_same_domain(url: &Url, domain: &str) -> bool {
    url.host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(domain))
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::{absolute_url, is_same_domain, sanitize_url, url_to_domain};
    use crate::error::UrlError;

    #[test]
    fn sanitize_strips_query_and_adds_root_slash() {
        assert_eq!(sanitize_url("http://example.org"), "http://example.org/");
        assert_eq!(
            sanitize_url("https://example.org/blog/?p=4#top"),
            "https://example.org/blog/"
        );
        assert_eq!(
            sanitize_url("https://example.org/about"),
            "https://example.org/about"
        );
    }

    #[test]
    fn domain_extraction_validates_input() {
        assert_eq!(
            url_to_domain("http://example.org/").expect("domain"),
            "example.org"
        );
        assert_eq!(
            url_to_domain("example.org/about"),
            Err(UrlError::NoProtocolInformation(
                "example.org/about".to_string()
            ))
        );
        assert!(matches!(
            url_to_domain("http://example.org:8080/"),
            Err(UrlError::UnsupportedPortSpecifier(_))
        ));
        assert!(matches!(
            url_to_domain("http:/"),
            Err(UrlError::MalformedUrl(_))
        ));
        assert!(matches!(
            url_to_domain("https://"),
            Err(UrlError::MalformedUrl(_))
        ));
    }

    #[test]
    fn absolute_url_drops_fragments_and_foreign_schemes() {
        let base = Url::parse("http://example.org/blog/post").expect("base");
        assert_eq!(
            absolute_url(&base, "../about#team").map(String::from),
            Some("http://example.org/about".to_string())
        );
        assert_eq!(absolute_url(&base, "#top"), None);
        assert_eq!(absolute_url(&base, "mailto:hello@example.org"), None);
        assert_eq!(absolute_url(&base, "javascript:void(0)"), None);
    }

    #[test]
    fn same_domain_ignores_case() {
        let url = Url::parse("http://Example.org/a").expect("url");
        assert!(is_same_domain(&url, "example.org"));
        assert!(!is_same_domain(&url, "cdn.example.org"));
    }
}
