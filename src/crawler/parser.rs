//! HTML parser for extracting links and image URLs
//!
//! All returned URLs are absolute and normalized, and each appears once per
//! page in document order.

use crate::url::resolve_url;
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Extracted information from an HTML page
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    /// The page title (from <title> tag)
    pub title: Option<String>,

    /// Page links to consider for the frontier
    pub links: Vec<String>,

    /// Image URLs referenced by the page
    pub images: Vec<String>,
}

/// Parses HTML content and extracts links, images, and the title
///
/// # Link Extraction Rules
///
/// **Include:** `<a href="...">`
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` links and data URIs
/// - Fragment-only links (same page anchors)
///
/// # Image Extraction Rules
///
/// - `<img src>` and lazy-loading `<img data-src>`
/// - The first candidate of `srcset` on `<img>` and `<picture><source>`
/// - `<meta property="og:image" content>`
///
/// # Arguments
///
/// * `html` - The HTML content to parse
/// * `base_url` - The base URL for resolving relative references
///
/// # Example
///
/// ```
/// use image_harvest::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head>
///     <body><a href="/page">Link</a><img src="a.jpg"></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title, Some("Test".to_string()));
/// assert_eq!(parsed.links, vec!["https://example.com/page"]);
/// assert_eq!(parsed.images, vec!["https://example.com/a.jpg"]);
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        links: extract_links(&document, base_url),
        images: extract_images(&document, base_url),
    }
}

/// Extracts the page title from the HTML document
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = UniqueUrls::default();

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(href) = element.value().attr("href") {
                links.push(resolve_reference(href, base_url));
            }
        }
    }

    links.into_vec()
}

fn extract_images(document: &Html, base_url: &Url) -> Vec<String> {
    let mut images = UniqueUrls::default();

    if let Ok(img_selector) = Selector::parse("img") {
        for element in document.select(&img_selector) {
            let attrs = element.value();
            for attr in ["src", "data-src"] {
                if let Some(src) = attrs.attr(attr) {
                    images.push(resolve_reference(src, base_url));
                }
            }
            if let Some(srcset) = attrs.attr("srcset") {
                images.push(first_srcset_candidate(srcset).and_then(|c| resolve_reference(c, base_url)));
            }
        }
    }

    if let Ok(source_selector) = Selector::parse("source[srcset]") {
        for element in document.select(&source_selector) {
            if let Some(srcset) = element.value().attr("srcset") {
                images.push(first_srcset_candidate(srcset).and_then(|c| resolve_reference(c, base_url)));
            }
        }
    }

    if let Ok(og_selector) = Selector::parse(r#"meta[property="og:image"][content]"#) {
        for element in document.select(&og_selector) {
            if let Some(content) = element.value().attr("content") {
                images.push(resolve_reference(content, base_url));
            }
        }
    }

    images.into_vec()
}

/// Returns the URL of the first `srcset` candidate, without its descriptor
fn first_srcset_candidate(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .next()?
        .split_whitespace()
        .next()
        .filter(|candidate| !candidate.is_empty())
}

/// Resolves a reference to a normalized absolute URL
///
/// Returns None if the reference should be excluded:
/// - javascript:, mailto:, tel: schemes and data: URIs
/// - Fragment-only references
/// - Invalid or non-HTTP(S) URLs
fn resolve_reference(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    resolve_url(base_url, href).ok().map(String::from)
}

/// Order-preserving set of URLs
#[derive(Default)]
struct UniqueUrls {
    seen: HashSet<String>,
    urls: Vec<String>,
}

impl UniqueUrls {
    fn push(&mut self, url: Option<String>) {
        if let Some(url) = url {
            if self.seen.insert(url.clone()) {
                self.urls.push(url);
            }
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.urls
    }
}
