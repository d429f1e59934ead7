use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Raw capture of a page: where it lives and its serialized DOM.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub url: Url,
    pub html: String,
}

/// Anything that can hand back the current page. Implemented by static HTML
/// captures and by live browser sessions.
#[async_trait(?Send)]
pub trait DomSource {
    async fn current_url(&self) -> Result<Url>;
    async fn snapshot(&self) -> Result<PageSnapshot>;
}

/// A fixed page capture, used for `--html` runs and tests.
#[derive(Debug, Clone)]
pub struct StaticPage {
    url: Url,
    html: String,
}

impl StaticPage {
    pub fn new(url: &str, html: impl Into<String>) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid page URL: {}", url))?;
        Ok(Self { url, html: html.into() })
    }
}

#[async_trait(?Send)]
impl DomSource for StaticPage {
    async fn current_url(&self) -> Result<Url> {
        Ok(self.url.clone())
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        Ok(PageSnapshot {
            url: self.url.clone(),
            html: self.html.clone(),
        })
    }
}

/// A parsed snapshot with the lookups detectors need. Every accessor returns
/// `None`/empty for missing nodes rather than failing.
pub struct Page {
    pub url: Url,
    pub document: Html,
}

impl Page {
    pub fn parse(snapshot: &PageSnapshot) -> Self {
        Self {
            url: snapshot.url.clone(),
            document: Html::parse_document(&snapshot.html),
        }
    }

    /// First element matching any of `selectors`, tried in order.
    pub fn first<'a>(&'a self, selectors: &[&str]) -> Option<ElementRef<'a>> {
        selectors.iter().find_map(|css| {
            let selector = Selector::parse(css).ok()?;
            self.document.select(&selector).next()
        })
    }

    /// Trimmed, whitespace-collapsed text of the first non-empty match.
    pub fn text(&self, selectors: &[&str]) -> Option<String> {
        selectors.iter().find_map(|css| {
            let selector = Selector::parse(css).ok()?;
            self.document
                .select(&selector)
                .map(element_text)
                .find(|t| !t.is_empty())
        })
    }

    /// Text of every match of the first selector that matches anything.
    pub fn texts(&self, selectors: &[&str]) -> Vec<String> {
        for css in selectors {
            let Ok(selector) = Selector::parse(css) else { continue };
            let found: Vec<String> = self
                .document
                .select(&selector)
                .map(element_text)
                .filter(|t| !t.is_empty())
                .collect();
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    pub fn attr(&self, selectors: &[&str], name: &str) -> Option<String> {
        selectors.iter().find_map(|css| {
            let selector = Selector::parse(css).ok()?;
            self.document
                .select(&selector)
                .find_map(|el| el.value().attr(name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }

    /// Resolve a possibly relative href against the page URL.
    pub fn absolute(&self, href: &str) -> Option<String> {
        self.url.join(href).ok().map(|u| u.to_string())
    }

    pub fn select_all<'a>(&'a self, css: &str) -> Vec<ElementRef<'a>> {
        match Selector::parse(css) {
            Ok(selector) => self.document.select(&selector).collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Children of `scope` matching `css`.
pub fn select_within<'a>(scope: ElementRef<'a>, css: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(css) {
        Ok(selector) => scope.select(&selector).collect(),
        Err(_) => Vec::new(),
    }
}

/// CSS selector that addresses a form control: by id when it has one,
/// otherwise by tag and name.
pub fn control_selector(el: ElementRef<'_>) -> Option<String> {
    let value = el.value();
    if let Some(id) = value.attr("id").filter(|id| !id.is_empty()) {
        return Some(format!("[id=\"{}\"]", css_escape(id)));
    }
    value
        .attr("name")
        .filter(|n| !n.is_empty())
        .map(|name| format!("{}[name=\"{}\"]", value.name(), css_escape(name)))
}

fn css_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
