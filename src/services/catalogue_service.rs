use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::config::RomToolConfig;
use crate::errors::SearchError;
use crate::models::{GameEntry, MirrorLink};

const REGION_CELL: usize = 1;
const SIZE_CELL: usize = 2;
const DOWNLOAD_EXTENSIONS: [&str; 6] = [".iso", ".zip", ".rar", ".7z", ".part1.rar", ".001"];
const DOWNLOAD_KEYWORDS: [&str; 5] = ["mirror", "download", "direct", "link", "get"];

static GAME_LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)/(xbox|games?)/").unwrap());

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid css selector")
}

struct Anchor {
    href: String,
    text: String,
}

impl Anchor {
    /// `None` for anchors without a usable `href`.
    fn from_element(element: ElementRef<'_>) -> Option<Anchor> {
        let href = element.value().attr("href")?.trim();
        if href.is_empty() {
            return None;
        }
        Some(Anchor {
            href: href.to_string(),
            text: element_text(element),
        })
    }
}

/// Visible text with runs of whitespace collapsed.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn anchors(document: &Html) -> Vec<Anchor> {
    let links = selector("a[href]");
    document.select(&links).filter_map(Anchor::from_element).collect()
}

/// Parent-directory and column-sort links on index pages.
fn is_navigation(href: &str, text: &str) -> bool {
    href.starts_with('?')
        || href.starts_with('#')
        || href == "../"
        || href == ".."
        || href == "/"
        || text.eq_ignore_ascii_case("parent directory")
        || text.eq_ignore_ascii_case("parent directory/")
}

fn absolute(href: &str, base: &Url) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    base.join(href).ok().map(String::from)
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Table rows first; when none parse, any anchor that looks like a game link.
pub fn parse_catalogue(html: &str, base: &Url) -> Vec<GameEntry> {
    let document = Html::parse_document(html);
    let entries = parse_rows(&document, base);
    if !entries.is_empty() {
        return entries;
    }
    anchors(&document)
        .into_iter()
        .filter(|anchor| GAME_LINK_RE.is_match(&anchor.href))
        .filter(|anchor| !anchor.text.is_empty() && !is_navigation(&anchor.href, &anchor.text))
        .filter_map(|anchor| {
            Some(GameEntry {
                detail_url: absolute(&anchor.href, base)?,
                title: anchor.text,
                region: None,
                size_hint: None,
            })
        })
        .collect()
}

fn parse_rows(document: &Html, base: &Url) -> Vec<GameEntry> {
    let rows = selector("tr");
    let first_anchor = selector("a");
    let cells = selector("td");

    let mut entries = Vec::new();
    for row in document.select(&rows) {
        let Some(anchor) = row.select(&first_anchor).next().and_then(Anchor::from_element) else {
            continue;
        };
        if anchor.text.is_empty() || is_navigation(&anchor.href, &anchor.text) {
            continue;
        }
        let Some(detail_url) = absolute(&anchor.href, base) else {
            continue;
        };
        let texts: Vec<String> = row.select(&cells).map(element_text).collect();
        entries.push(GameEntry {
            title: anchor.text,
            detail_url,
            region: texts.get(REGION_CELL).cloned().and_then(non_empty),
            size_hint: texts.get(SIZE_CELL).cloned().and_then(non_empty),
        });
    }
    entries
}

fn is_download_link(href: &str, text: &str) -> bool {
    let href = href.to_ascii_lowercase();
    let text = text.to_lowercase();
    DOWNLOAD_EXTENSIONS.iter().any(|ext| href.ends_with(ext))
        || DOWNLOAD_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

/// Download links on a detail page, de-duplicated by URL in page order.
pub fn parse_mirrors(html: &str, base: &Url) -> Vec<MirrorLink> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut mirrors = Vec::new();
    for anchor in anchors(&document) {
        let label = if anchor.text.is_empty() {
            anchor.href.clone()
        } else {
            anchor.text
        };
        if !is_download_link(&anchor.href, &label) {
            continue;
        }
        let Some(url) = absolute(&anchor.href, base) else {
            continue;
        };
        if seen.insert(url.clone()) {
            mirrors.push(MirrorLink { label, url });
        }
    }
    mirrors
}

/// Case-insensitive substring match on the title; a blank query keeps all.
pub fn search(entries: &[GameEntry], query: &str) -> Vec<GameEntry> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return entries.to_vec();
    }
    entries
        .iter()
        .filter(|entry| entry.title.to_lowercase().contains(&query))
        .cloned()
        .collect()
}

#[derive(Clone)]
pub struct CatalogueService {
    client: reqwest::Client,
    catalogue_url: String,
}

impl CatalogueService {
    pub fn new(client: reqwest::Client, catalogue_url: impl Into<String>) -> Self {
        Self {
            client,
            catalogue_url: catalogue_url.into(),
        }
    }

    pub fn from_config(config: &RomToolConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.http_timeout())
            .user_agent(concat!("romtool/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new(client, config.catalogue_url.clone())
    }

    pub async fn fetch_catalogue(&self) -> Result<Vec<GameEntry>, SearchError> {
        let (base, html) = self.get_page(&self.catalogue_url).await?;
        let entries = parse_catalogue(&html, &base);
        tracing::info!("parsed {} catalogue entries from {}", entries.len(), base);
        if entries.is_empty() {
            return Err(SearchError::NothingParsed);
        }
        Ok(entries)
    }

    pub async fn fetch_mirrors(&self, game: &GameEntry) -> Result<Vec<MirrorLink>, SearchError> {
        let (base, html) = self.get_page(&game.detail_url).await?;
        let mirrors = parse_mirrors(&html, &base);
        if mirrors.is_empty() {
            return Err(SearchError::NoMirrors {
                title: game.title.clone(),
            });
        }
        tracing::debug!("found {} mirrors for {}", mirrors.len(), game.title);
        Ok(mirrors)
    }

    /// Body plus the final URL after redirects, for resolving relative links.
    async fn get_page(&self, url: &str) -> Result<(Url, String), SearchError> {
        let network = |err: reqwest::Error| SearchError::Network {
            url: url.to_string(),
            reason: err.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let base = response.url().clone();
        let html = response.text().await.map_err(network)?;
        Ok((base, html))
    }
}
