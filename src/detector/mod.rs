//! Job-board detection.
//!
//! Each supported board implements [`JobBoard`] against its own DOM; the
//! [`Registry`] picks a board by hostname and the [`Detector`] wraps it with a
//! time-bounded cache of the extracted posting.

pub mod greenhouse;
pub mod indeed;
pub mod linkedin;
pub mod parse;

use anyhow::Result;
use scraper::ElementRef;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::dom::{self, DomSource, Page};
use crate::models::{JobPosting, JobType, ScreeningQuestion, Seniority};

/// The capability set every job board provides.
pub trait JobBoard {
    /// Short stable name, used as `JobPosting::source_site`.
    fn name(&self) -> &'static str;

    /// Hostnames this board serves; subdomains match too.
    fn hosts(&self) -> &'static [&'static str];

    /// Whether the URL (path and query) addresses a job-detail or application page.
    fn is_job_path(&self, url: &Url) -> bool;

    fn extract_job_data(&self, page: &Page) -> JobPosting;

    fn extract_questions(&self, page: &Page) -> Vec<ScreeningQuestion>;

    fn matches_host(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_lowercase();
        self.hosts()
            .iter()
            .any(|known| host == *known || host.ends_with(&format!(".{}", known)))
    }

    /// Host match alone is not enough: the path must be a job page as well.
    fn is_job_board(&self, url: &Url) -> bool {
        self.matches_host(url) && self.is_job_path(url)
    }

    fn parse_job_type(&self, text: &str) -> Option<JobType> {
        parse::parse_job_type(text)
    }

    fn parse_seniority(&self, text: &str) -> Option<Seniority> {
        parse::parse_seniority(text)
    }

    fn parse_applicant_count(&self, text: &str) -> Option<u32> {
        parse::parse_applicant_count(text)
    }

    fn is_remote(&self, location: &str, description: &str) -> bool {
        parse::is_remote(location, description)
    }
}

/// Boards known to the pipeline, dispatched by hostname.
pub struct Registry {
    boards: Vec<Rc<dyn JobBoard>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { boards: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Rc::new(linkedin::LinkedIn));
        registry.register(Rc::new(indeed::Indeed));
        registry.register(Rc::new(greenhouse::Greenhouse));
        registry
    }

    pub fn register(&mut self, board: Rc<dyn JobBoard>) {
        self.boards.push(board);
    }

    /// The board serving this host, whatever the path.
    pub fn resolve(&self, url: &Url) -> Option<Rc<dyn JobBoard>> {
        self.boards.iter().find(|b| b.matches_host(url)).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.boards.iter().map(|b| b.name()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct CachedPosting {
    posting: Rc<JobPosting>,
    captured_at: Instant,
}

/// One board bound to one page source, with the extracted posting memoized
/// for `ttl`. There is no reliable DOM-changed signal across third-party
/// pages, so expiry is purely time based.
pub struct Detector {
    board: Rc<dyn JobBoard>,
    source: Rc<dyn DomSource>,
    ttl: Duration,
    cache: Option<CachedPosting>,
}

impl Detector {
    pub fn new(board: Rc<dyn JobBoard>, source: Rc<dyn DomSource>, ttl: Duration) -> Self {
        Self {
            board,
            source,
            ttl,
            cache: None,
        }
    }

    pub async fn is_job_board(&self) -> Result<bool> {
        let url = self.source.current_url().await?;
        Ok(self.board.is_job_board(&url))
    }

    /// Read the page and extract a fresh posting, bypassing the cache.
    pub async fn extract_job_data(&self) -> Result<JobPosting> {
        let snapshot = self.source.snapshot().await?;
        let page = Page::parse(&snapshot);
        Ok(self.board.extract_job_data(&page))
    }

    /// Memoized extraction. Within the TTL the same `Rc` is handed back and
    /// the page is not read; after it the cache is dropped and rebuilt.
    pub async fn detect(&mut self) -> Result<Rc<JobPosting>> {
        if let Some(cached) = &self.cache {
            if cached.captured_at.elapsed() < self.ttl {
                debug!(board = self.board.name(), "Reusing cached job posting");
                return Ok(Rc::clone(&cached.posting));
            }
            debug!(board = self.board.name(), "Cached job posting expired");
            self.cache = None;
        }

        let posting = Rc::new(self.extract_job_data().await?);
        debug!(
            board = self.board.name(),
            title = %posting.title,
            company = %posting.company,
            "Extracted job posting"
        );
        self.cache = Some(CachedPosting {
            posting: Rc::clone(&posting),
            captured_at: Instant::now(),
        });
        Ok(posting)
    }

    pub fn is_cached(&self) -> bool {
        self.cache
            .as_ref()
            .is_some_and(|c| c.captured_at.elapsed() < self.ttl)
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Screening questions on the current application form. Forms move step
    /// to step, so this always reads the page.
    pub async fn screening_questions(&self) -> Result<Vec<ScreeningQuestion>> {
        let snapshot = self.source.snapshot().await?;
        let page = Page::parse(&snapshot);
        let questions = self.board.extract_questions(&page);
        debug!(board = self.board.name(), count = questions.len(), "Extracted screening questions");
        Ok(questions)
    }
}

/// Collected attributes of one form control, shared by the board parsers.
pub(crate) struct ControlInfo {
    pub tag: String,
    pub input_type: Option<String>,
    pub selector: String,
    pub required: bool,
    pub max_length: Option<usize>,
    pub options: Vec<String>,
}

/// Build a [`ScreeningQuestion`] from a question label and the controls
/// found under its container. Returns `None` when no usable control exists.
pub(crate) fn question_from_controls(
    position: usize,
    label: &str,
    container: ElementRef<'_>,
) -> Option<ScreeningQuestion> {
    let text = label.trim().trim_end_matches('*').trim().to_string();
    if text.is_empty() {
        return None;
    }
    let control = read_control(container)?;
    let question_type = parse::infer_question_type(
        &control.tag,
        control.input_type.as_deref(),
        &control.options,
    );
    Some(ScreeningQuestion {
        id: parse::question_id(position, &text),
        text,
        question_type,
        is_required: control.required || label.trim_end().ends_with('*'),
        max_length: control.max_length,
        options: if control.options.is_empty() {
            None
        } else {
            Some(control.options)
        },
        selector: control.selector,
    })
}

fn read_control(container: ElementRef<'_>) -> Option<ControlInfo> {
    let radios = dom::select_within(container, "input[type='radio']");
    if let Some(first) = radios.first() {
        let name = first.value().attr("name")?;
        let options = radios
            .iter()
            .filter_map(|r| radio_label(container, *r))
            .collect::<Vec<_>>();
        return Some(ControlInfo {
            tag: "input".to_string(),
            input_type: Some("radio".to_string()),
            selector: format!("input[type=\"radio\"][name=\"{}\"]", name.replace('"', "\\\"")),
            required: radios.iter().any(|r| is_required(*r)),
            max_length: None,
            options,
        });
    }

    let el = dom::select_within(container, "select, textarea, input")
        .into_iter()
        .find(|el| {
            !matches!(
                el.value().attr("type").map(|t| t.to_lowercase()).as_deref(),
                Some("hidden" | "submit" | "button" | "file")
            )
        })?;
    let value = el.value();
    let tag = value.name().to_lowercase();
    let options = if tag == "select" {
        dom::select_within(el, "option")
            .into_iter()
            .map(dom::element_text)
            .filter(|o| !parse::is_placeholder_option(o))
            .collect()
    } else {
        Vec::new()
    };
    Some(ControlInfo {
        selector: dom::control_selector(el)?,
        input_type: value.attr("type").map(|t| t.to_lowercase()),
        required: is_required(el),
        max_length: value.attr("maxlength").and_then(|m| m.trim().parse().ok()),
        options,
        tag,
    })
}

fn is_required(el: ElementRef<'_>) -> bool {
    let value = el.value();
    value.attr("required").is_some()
        || value
            .attr("aria-required")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub(crate) fn radio_label(container: ElementRef<'_>, radio: ElementRef<'_>) -> Option<String> {
    let value = radio.value();
    if let Some(id) = value.attr("id") {
        let labelled = dom::select_within(container, &format!("label[for=\"{}\"]", id))
            .into_iter()
            .map(dom::element_text)
            .find(|t| !t.is_empty());
        if labelled.is_some() {
            return labelled;
        }
    }
    value
        .attr("value")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
