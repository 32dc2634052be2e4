use anyhow::{Context, Result};
use mailhive_common::{append_unique, normalize_base_url, SearchDomain, Website};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result pages are ten entries apart
const RESULTS_PER_PAGE: u32 = 10;

const SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Keyword search against a result-page API. Runs without a browser.
#[tonic::async_trait]
pub trait KeywordSearch: Send + Sync {
    fn name(&self) -> &str;

    /// Websites for `keyword` across `page_count` result pages, unique by base URL
    async fn search(
        &self,
        keyword: &str,
        page_count: u32,
        domain: SearchDomain,
    ) -> Result<Vec<Website>>;
}

#[derive(Debug, Default, Deserialize)]
pub struct SerpResponse {
    #[serde(default)]
    pub organic_results: Vec<SerpEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SerpEntry {
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub snippet_highlighted_words: Vec<String>,
    #[serde(default)]
    pub about_this_result: AboutThisResult,
}

#[derive(Debug, Default, Deserialize)]
pub struct AboutThisResult {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

/// reqwest client for a SerpAPI-style JSON endpoint
#[derive(Clone)]
pub struct SerpSearch {
    client: reqwest::Client,
    base_link: String,
}

impl SerpSearch {
    /// `base_link` must end where query parameters can be appended (`...?api_key=x&`)
    pub fn new(base_link: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build search HTTP client")?;

        Ok(Self {
            client,
            base_link: base_link.into(),
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<SerpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<SerpResponse>()
            .await?;
        Ok(response)
    }
}

/// URL of one result page. The keyword is form-encoded (spaces become `+`).
pub fn build_search_url(base_link: &str, keyword: &str, domain: SearchDomain, page: u32) -> String {
    let query: String = url::form_urlencoded::byte_serialize(keyword.as_bytes()).collect();
    format!(
        "{}domain_google={}&gl={}&hl={}&q={}&start={}",
        base_link,
        domain.domain(),
        domain.country(),
        domain.language(),
        query,
        page * RESULTS_PER_PAGE
    )
}

/// Map result entries onto websites, skipping base URLs already in `into`
pub fn merge_results(response: SerpResponse, into: &mut Vec<Website>) {
    for entry in response.organic_results {
        if entry.link.is_empty() {
            continue;
        }
        let base_url = normalize_base_url(&entry.link);
        if into.iter().any(|w| w.base_url == base_url) {
            continue;
        }

        let mut website = Website::new(&base_url);
        website.title = entry.title;
        website.description = entry.snippet;
        for word in entry.snippet_highlighted_words {
            append_unique(&mut website.matched_snippet_words, word);
        }
        for language in entry.about_this_result.languages {
            append_unique(&mut website.languages, language);
        }
        for region in entry.about_this_result.regions {
            append_unique(&mut website.regions, region);
        }
        into.push(website);
    }
}

#[tonic::async_trait]
impl KeywordSearch for SerpSearch {
    fn name(&self) -> &str {
        "serp"
    }

    async fn search(
        &self,
        keyword: &str,
        page_count: u32,
        domain: SearchDomain,
    ) -> Result<Vec<Website>> {
        let page_count = page_count.max(1);

        let mut join_set = JoinSet::new();
        for page in 0..page_count {
            let engine = self.clone();
            let url = build_search_url(&self.base_link, keyword, domain, page);
            join_set.spawn(async move { (page, engine.fetch_page(&url).await) });
        }

        let mut pages = Vec::with_capacity(page_count as usize);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((page, Ok(response))) => pages.push((page, response)),
                Ok((page, Err(e))) => {
                    warn!(keyword = %keyword, "Result page {} failed: {}", page, e);
                }
                Err(e) => warn!(keyword = %keyword, "Result page task failed: {}", e),
            }
        }

        // Merge in page order so earlier pages win on duplicates
        pages.sort_by_key(|(page, _)| *page);
        let mut websites = Vec::new();
        for (_, response) in pages {
            merge_results(response, &mut websites);
        }

        debug!(
            keyword = %keyword,
            "Keyword search returned {} website(s) over {} page(s)",
            websites.len(),
            page_count
        );
        Ok(websites)
    }
}
