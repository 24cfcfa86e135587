//! Paged collection over JSON listing endpoints.
//!
//! Two strategies: follow the `next` links one page at a time, or learn the
//! page ceiling from the first response and fetch the remaining pages
//! concurrently.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{get_json, FetchError, JsonFetch};

/// Listing envelope: records under `dados` (or `data`) plus hypermedia links.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Envelope<T> {
    #[serde(alias = "dados", default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

impl<T> Envelope<T> {
    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == rel)
            .map(|l| l.href.as_str())
    }
}

/// Follows `next` links until a page has none or a URL repeats. Empty pages
/// in the middle of the chain are skipped, not treated as the end.
pub async fn collect_linked<T, F>(http: &F, first_url: &str) -> Result<Vec<T>, FetchError>
where
    T: DeserializeOwned,
    F: JsonFetch + ?Sized,
{
    let mut items = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(first_url.to_string());

    while let Some(url) = next.take() {
        if !visited.insert(url.clone()) {
            warn!(%url, "pagination link cycle; stopping");
            break;
        }
        let page: Envelope<T> = get_json(http, &url).await?;
        debug!(%url, count = page.data.len(), "page collected");
        next = page.link("next").map(str::to_string);
        items.extend(page.data);
    }

    Ok(items)
}

/// Builds page URLs by setting one query parameter on a base listing URL.
#[derive(Debug, Clone)]
pub struct PageUrl {
    base: Url,
    param: String,
}

impl PageUrl {
    pub fn parse(base: &str, param: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self {
            base: Url::parse(base)?,
            param: param.into(),
        })
    }

    pub fn page(&self, number: u32) -> String {
        let mut url = self.base.clone();
        let kept: Vec<(String, String)> = self
            .base
            .query_pairs()
            .filter(|(k, _)| k != self.param.as_str())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(&self.param, &number.to_string());
        url.to_string()
    }

    /// Reads the page number out of an arbitrary link href.
    pub fn page_of(&self, href: &str) -> Option<u32> {
        let url = Url::parse(href).ok()?;
        let value = url
            .query_pairs()
            .find(|(k, _)| k == self.param.as_str())
            .map(|(_, v)| v.into_owned())?;
        value.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveOptions {
    pub workers: usize,
    /// Ceiling used when the first page exposes no usable `last` link.
    pub fallback_max_pages: u32,
    /// Hard cap regardless of what the source advertises.
    pub max_pages: u32,
    /// Extra attempts for a page that failed with a transient error.
    pub page_retries: usize,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            fallback_max_pages: 50,
            max_pages: 500,
            page_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeilingSource {
    LastLink,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct AdaptiveOutcome<T> {
    pub items: Vec<T>,
    pub ceiling: u32,
    pub ceiling_source: CeilingSource,
    pub pages_with_items: u32,
    pub empty_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
}

enum PageResult<T> {
    Items(u32, Vec<T>),
    Empty(u32),
    Failed(u32, FetchError),
}

async fn fetch_page_with_retry<T, F>(http: &F, url: String, page: u32, retries: usize) -> PageResult<T>
where
    T: DeserializeOwned,
    F: JsonFetch + ?Sized,
{
    let mut attempt = 0usize;
    loop {
        match get_json::<Envelope<T>, F>(http, &url).await {
            Ok(env) if env.data.is_empty() => return PageResult::Empty(page),
            Ok(env) => return PageResult::Items(page, env.data),
            Err(err) if err.is_transient() && attempt < retries => {
                debug!(page, %err, "retrying page");
                attempt += 1;
            }
            Err(err) => return PageResult::Failed(page, err),
        }
    }
}

/// Fetches page 1, derives a ceiling, then fetches pages `2..=ceiling` with
/// up to `workers` requests in flight. Items come back ordered by page.
///
/// Only a page-1 failure is an error; later failures are reported in
/// [`AdaptiveOutcome::failed_pages`] and kept apart from empty pages.
pub async fn collect_adaptive<T, F>(
    http: &F,
    url: &PageUrl,
    options: &AdaptiveOptions,
) -> Result<AdaptiveOutcome<T>, FetchError>
where
    T: DeserializeOwned + Send,
    F: JsonFetch + ?Sized,
{
    let first: Envelope<T> = get_json(http, &url.page(1)).await?;

    let (ceiling, ceiling_source) = match first.link("last").and_then(|href| url.page_of(href)) {
        Some(last) => (last, CeilingSource::LastLink),
        None => (options.fallback_max_pages, CeilingSource::Fallback),
    };
    let ceiling = ceiling.clamp(1, options.max_pages.max(1));

    let mut outcome = AdaptiveOutcome {
        items: Vec::new(),
        ceiling,
        ceiling_source,
        pages_with_items: 0,
        empty_pages: Vec::new(),
        failed_pages: Vec::new(),
    };

    if first.data.is_empty() {
        outcome.empty_pages.push(1);
        return Ok(outcome);
    }
    outcome.pages_with_items = 1;
    let mut pages: Vec<(u32, Vec<T>)> = vec![(1, first.data)];

    let results: Vec<PageResult<T>> = stream::iter(2..=ceiling)
        .map(|page| fetch_page_with_retry(http, url.page(page), page, options.page_retries))
        .buffer_unordered(options.workers.max(1))
        .collect()
        .await;

    for result in results {
        match result {
            PageResult::Items(page, items) => {
                outcome.pages_with_items += 1;
                pages.push((page, items));
            }
            PageResult::Empty(page) => outcome.empty_pages.push(page),
            PageResult::Failed(page, err) => {
                warn!(page, %err, "page failed after retries");
                outcome.failed_pages.push(page);
            }
        }
    }

    pages.sort_by_key(|(page, _)| *page);
    outcome.items = pages.into_iter().flat_map(|(_, items)| items).collect();
    outcome.empty_pages.sort_unstable();
    outcome.failed_pages.sort_unstable();

    debug!(
        ceiling = outcome.ceiling,
        pages_with_items = outcome.pages_with_items,
        empty = outcome.empty_pages.len(),
        failed = outcome.failed_pages.len(),
        "adaptive collection finished"
    );
    Ok(outcome)
}
