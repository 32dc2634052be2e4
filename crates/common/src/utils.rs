/// Extract domain from URL
pub fn extract_domain(url: &str) -> anyhow::Result<String> {
    url::Url::parse(url)?
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_string())
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))
}

/// Resolve an anchor `href` against the page it was found on.
///
/// Returns None for links that cannot be loaded as a page (`mailto:`,
/// `javascript:`, fragments, non-http schemes).
pub fn resolve_link(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let base = url::Url::parse(base).ok()?;
    let mut resolved = base.join(href).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}
