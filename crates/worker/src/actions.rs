use anyhow::Result;
use mailhive_common::utils::{extract_domain, resolve_link};
use mailhive_common::{append_unique, Website};
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::browser::{BrowserAction, BrowserPage};

/// Sub-page path fragments likely to carry contact details
pub const CONTACT_PATH_PATTERNS: &[&str] = &["info", "more", "contact", "about", "legal", "privacy"];

pub const SOCIAL_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "dribbble.com",
    "behance.net",
];

/// Matches that end in these are asset file names (logo@2x.png), not mailboxes
const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".svg", ".webp", ".pdf"];

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});

/// Visit a site's landing page and its contact-like sub-pages, collecting
/// title, description, sub-paths, mail addresses and social profiles
#[derive(Debug, Clone, Default)]
pub struct ExtractMails;

impl BrowserAction for ExtractMails {
    fn name(&self) -> &str {
        "extract_mails"
    }

    fn run(&self, page: &dyn BrowserPage, website: &mut Website) -> Result<()> {
        page.navigate(&website.base_url)?;
        let landing = Html::parse_document(&page.content()?);

        extract_metadata(&landing, website);
        for path in extract_contact_paths(&landing, &website.base_url) {
            append_unique(&mut website.paths, path);
        }
        drop(landing);

        let mut targets = website.paths.clone();
        targets.push(website.base_url.clone());

        for target in targets {
            let html = match page.navigate(&target).and_then(|_| page.content()) {
                Ok(html) => html,
                Err(e) => {
                    warn!(base_url = %website.base_url, "Skipping {}: {}", target, e);
                    continue;
                }
            };

            for mail in extract_emails(&html) {
                append_unique(&mut website.mails, mail);
            }
            let document = Html::parse_document(&html);
            for social in extract_socials(&document) {
                append_unique(&mut website.socials, social);
            }
        }

        debug!(
            base_url = %website.base_url,
            "Extracted {} mail(s), {} path(s), {} social link(s)",
            website.mails.len(),
            website.paths.len(),
            website.socials.len()
        );
        Ok(())
    }
}

/// Fill title and meta description, keeping values already present
pub fn extract_metadata(document: &Html, website: &mut Website) {
    if website.title.is_empty() {
        if let Ok(selector) = Selector::parse("title") {
            if let Some(title) = document.select(&selector).next() {
                website.title = normalize_text(&title.text().collect::<String>());
            }
        }
    }

    if website.description.is_empty() {
        if let Ok(selector) = Selector::parse("meta[name=\"description\"]") {
            if let Some(content) = document
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("content"))
            {
                website.description = normalize_text(content);
            }
        }
    }
}

/// Same-site links whose path mentions one of [`CONTACT_PATH_PATTERNS`]
pub fn extract_contact_paths(document: &Html, base_url: &str) -> Vec<String> {
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let base_domain = extract_domain(base_url).ok();

    let mut paths = Vec::new();
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if href.trim_start().starts_with("mailto:") {
            continue;
        }
        let Some(resolved) = resolve_link(base_url, href) else {
            continue;
        };
        let Ok(parsed) = url::Url::parse(&resolved) else {
            continue;
        };
        // Only follow links on the site itself, "www." or not
        if extract_domain(&resolved).ok() != base_domain {
            continue;
        }

        let path = parsed.path().to_lowercase();
        if CONTACT_PATH_PATTERNS.iter().any(|p| path.contains(p)) {
            let mut page_url = parsed;
            page_url.set_query(None);
            append_unique(&mut paths, page_url.to_string());
        }
    }
    paths
}

/// Normalized mail addresses found anywhere in the raw HTML
pub fn extract_emails(html: &str) -> Vec<String> {
    let mut mails = Vec::new();
    for found in EMAIL_PATTERN.find_iter(html) {
        let mail = normalize_mail(found.as_str());
        if ASSET_SUFFIXES.iter().any(|suffix| mail.ends_with(suffix)) {
            continue;
        }
        append_unique(&mut mails, mail);
    }
    mails
}

/// Links pointing at a known social network
pub fn extract_socials(document: &Html) -> Vec<String> {
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut socials = Vec::new();
    for href in document.select(&selector).filter_map(|el| el.value().attr("href")) {
        let Ok(domain) = extract_domain(href.trim()) else {
            continue;
        };
        if SOCIAL_DOMAINS
            .iter()
            .any(|social| domain == *social || domain.ends_with(&format!(".{}", social)))
        {
            append_unique(&mut socials, href.trim());
        }
    }
    socials
}

/// Lowercase, drop a `mailto:` prefix and any query, strip invisible characters
pub fn normalize_mail(raw: &str) -> String {
    let text = normalize_text(raw).to_lowercase();
    let text = text.strip_prefix("mailto:").unwrap_or(&text);
    text.split('?').next().unwrap_or_default().trim().to_string()
}

fn normalize_text(raw: &str) -> String {
    raw.replace('\u{a0}', " ")
        .replace("%20", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
