/// Extract domain from URL
pub fn extract_domain(url: &str) -> anyhow::Result<String> {
    url::Url::parse(url)?
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_lowercase())
        .ok_or_else(|| anyhow::anyhow!("No host in URL: {}", url))
}

/// Whether `link` points at the same domain as `site` (`www.` is ignored)
pub fn same_domain(site: &str, link: &str) -> bool {
    match (extract_domain(site), extract_domain(link)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Resolve `href` against `base` and keep it only if it is an http(s) link on
/// the same domain. Fragments are stripped.
pub fn in_domain_link(base: &str, href: &str) -> Option<String> {
    let base_url = url::Url::parse(base).ok()?;
    let mut link = base_url.join(href).ok()?;
    if !matches!(link.scheme(), "http" | "https") {
        return None;
    }
    link.set_fragment(None);
    let link = link.to_string();
    same_domain(base, &link).then_some(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://example.com/path").unwrap(),
            "example.com"
        );
        assert_eq!(
            extract_domain("http://www.Example.com:8080/path").unwrap(),
            "example.com"
        );
        assert!(extract_domain("not a url").is_err());
    }

    #[test]
    fn test_same_domain() {
        assert!(same_domain("https://www.example.com", "http://example.com/a"));
        assert!(!same_domain("https://example.com", "https://sub.example.com"));
        assert!(!same_domain("https://example.com", "mailto:someone@example.com"));
    }

    #[test]
    fn test_in_domain_link() {
        let base = "https://example.com/news/";
        assert_eq!(
            in_domain_link(base, "item?id=1#top"),
            Some("https://example.com/news/item?id=1".to_string())
        );
        assert_eq!(
            in_domain_link(base, "/about"),
            Some("https://example.com/about".to_string())
        );
        assert_eq!(in_domain_link(base, "https://other.org/"), None);
        assert_eq!(in_domain_link(base, "javascript:void(0)"), None);
    }
}
