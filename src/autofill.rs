use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detector::{parse, radio_label};
use crate::dom;
use crate::models::{GeneratedAnswer, QuestionFailure, ScreeningQuestion};

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"));

const FUZZY_OPTION_FLOOR: f64 = 0.6;
const CHECKED: &str = "checked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    TextArea,
    Number,
    Select,
    Radio,
    Checkbox,
}

/// What a driver reports about a control before it is written. `value` is
/// the visible text for text fields, the chosen option label for selects and
/// radio groups (empty while a placeholder is selected), and `"checked"` or
/// `""` for checkboxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub kind: FieldKind,
    pub value: String,
    pub enabled: bool,
    pub options: Vec<String>,
}

/// Write access to the page's form controls. Every write must fire the
/// control's native input/change events.
#[async_trait(?Send)]
pub trait FormDriver {
    async fn field(&self, selector: &str) -> Result<Option<FieldInfo>>;

    async fn clear(&self, selector: &str) -> Result<()>;

    /// Append one keystroke's worth of text.
    async fn type_text(&self, selector: &str, chunk: &str) -> Result<()>;

    /// Replace the value in one step.
    async fn set_value(&self, selector: &str, value: &str) -> Result<()>;

    /// Pick a select option or radio button by its label.
    async fn choose_option(&self, selector: &str, option: &str) -> Result<()>;

    async fn set_checked(&self, selector: &str, checked: bool) -> Result<()>;

    async fn read_value(&self, selector: &str) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum FillFailure {
    #[error("Field not found: {0}")]
    NotFound(String),

    #[error("Field is disabled")]
    Disabled,

    #[error("Value was rejected: wrote {expected:?}, field holds {found:?}")]
    Rejected { expected: String, found: String },

    #[error("No option matches {0:?}")]
    NoMatchingOption(String),

    #[error("Form driver error: {0}")]
    Driver(String),
}

impl FillFailure {
    fn driver(e: anyhow::Error) -> Self {
        FillFailure::Driver(format!("{:#}", e))
    }
}

// --- Typing simulation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keystroke<'t> {
    /// Wait before committing `chunk`.
    pub pause: Duration,
    pub chunk: &'t str,
}

/// Steps through a text one character at a time. The first keystroke has no
/// pause; later ones wait `delay` shifted by up to `jitter` either way.
pub struct Keystrokes<'t> {
    text: &'t str,
    offset: usize,
    delay: Duration,
    jitter: Duration,
    rng: StdRng,
}

impl<'t> Keystrokes<'t> {
    pub fn new(text: &'t str, delay: Duration, jitter: Duration) -> Self {
        Self::with_rng(text, delay, jitter, StdRng::from_entropy())
    }

    pub fn with_rng(text: &'t str, delay: Duration, jitter: Duration, rng: StdRng) -> Self {
        Self {
            text,
            offset: 0,
            delay,
            jitter,
            rng,
        }
    }

    fn next_pause(&mut self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter = self.jitter.as_millis() as i64;
        let shifted = self.delay.as_millis() as i64 + self.rng.gen_range(-jitter..=jitter);
        Duration::from_millis(shifted.max(0) as u64)
    }
}

impl<'t> Iterator for Keystrokes<'t> {
    type Item = Keystroke<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.text[self.offset..];
        let ch = rest.chars().next()?;
        let pause = if self.offset == 0 { Duration::ZERO } else { self.next_pause() };
        let chunk = &rest[..ch.len_utf8()];
        self.offset += ch.len_utf8();
        Some(Keystroke { pause, chunk })
    }
}

// --- Engine ---

#[derive(Debug, Clone, Copy)]
pub struct FillOptions {
    pub skip_filled: bool,
    pub simulate_typing: bool,
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            skip_filled: true,
            simulate_typing: true,
            delay_ms: 40,
            jitter_ms: 25,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillReport {
    /// True when every answered question was filled or deliberately skipped.
    pub success: bool,
    pub filled_count: usize,
    pub skipped: Vec<String>,
    pub failures: Vec<QuestionFailure>,
}

enum Filled {
    Written,
    Skipped,
}

pub struct AutofillEngine<'d> {
    driver: &'d dyn FormDriver,
}

impl<'d> AutofillEngine<'d> {
    pub fn new(driver: &'d dyn FormDriver) -> Self {
        Self { driver }
    }

    /// Write each answer into its question's control, in question order.
    /// Questions without an answer are left alone; a failing field is
    /// reported and the rest are still filled.
    pub async fn fill_answers(
        &self,
        questions: &[ScreeningQuestion],
        answers: &[GeneratedAnswer],
        options: FillOptions,
    ) -> FillReport {
        let mut report = FillReport::default();

        for question in questions {
            let Some(answer) = answers.iter().find(|a| a.question_id == question.id) else {
                continue;
            };
            match self.fill_one(question, &answer.answer, options).await {
                Ok(Filled::Written) => {
                    debug!(question = %question.id, selector = %question.selector, "Filled field");
                    report.filled_count += 1;
                }
                Ok(Filled::Skipped) => {
                    debug!(question = %question.id, "Field already filled, skipping");
                    report.skipped.push(question.id.clone());
                }
                Err(e) => {
                    warn!(
                        question = %question.id,
                        selector = %question.selector,
                        error = %e,
                        "Could not fill field"
                    );
                    report.failures.push(QuestionFailure {
                        question_id: question.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.success = report.failures.is_empty();
        info!(
            filled = report.filled_count,
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Autofill finished"
        );
        report
    }

    async fn fill_one(
        &self,
        question: &ScreeningQuestion,
        answer: &str,
        options: FillOptions,
    ) -> Result<Filled, FillFailure> {
        let selector = question.selector.as_str();
        let field = self
            .driver
            .field(selector)
            .await
            .map_err(FillFailure::driver)?
            .ok_or_else(|| FillFailure::NotFound(selector.to_string()))?;

        if !field.enabled {
            return Err(FillFailure::Disabled);
        }
        if options.skip_filled && !field.value.trim().is_empty() {
            return Ok(Filled::Skipped);
        }

        let answer = match question.max_length {
            Some(max) => truncate_chars(answer, max),
            None => answer.to_string(),
        };

        let expected = match field.kind {
            FieldKind::Select | FieldKind::Radio => {
                let option = match_option(&answer, &field.options)
                    .ok_or_else(|| FillFailure::NoMatchingOption(answer.clone()))?;
                self.driver.choose_option(selector, &option).await.map_err(FillFailure::driver)?;
                option
            }
            FieldKind::Checkbox => {
                let checked = parse_bool(&answer)
                    .ok_or_else(|| FillFailure::NoMatchingOption(answer.clone()))?;
                self.driver.set_checked(selector, checked).await.map_err(FillFailure::driver)?;
                if checked { CHECKED.to_string() } else { String::new() }
            }
            FieldKind::Number => {
                let number = NUMBER_RE
                    .find(&answer)
                    .map(|m| m.as_str().to_string())
                    .ok_or_else(|| FillFailure::Rejected {
                        expected: answer.clone(),
                        found: String::new(),
                    })?;
                self.write_text(selector, &number, options).await?;
                number
            }
            FieldKind::Text | FieldKind::TextArea => {
                self.write_text(selector, &answer, options).await?;
                answer
            }
        };

        let found = self.driver.read_value(selector).await.map_err(FillFailure::driver)?;
        if found != expected {
            return Err(FillFailure::Rejected { expected, found });
        }
        Ok(Filled::Written)
    }

    async fn write_text(
        &self,
        selector: &str,
        text: &str,
        options: FillOptions,
    ) -> Result<(), FillFailure> {
        if !options.simulate_typing {
            return self.driver.set_value(selector, text).await.map_err(FillFailure::driver);
        }

        self.driver.clear(selector).await.map_err(FillFailure::driver)?;
        let keystrokes = Keystrokes::new(
            text,
            Duration::from_millis(options.delay_ms),
            Duration::from_millis(options.jitter_ms),
        );
        for keystroke in keystrokes {
            if !keystroke.pause.is_zero() {
                tokio::time::sleep(keystroke.pause).await;
            }
            self.driver
                .type_text(selector, keystroke.chunk)
                .await
                .map_err(FillFailure::driver)?;
        }
        Ok(())
    }
}

/// Pick the option an answer refers to: exact (case-insensitive), then
/// yes/no for boolean answers, then the only option containing the answer,
/// then the closest label above the fuzzy floor.
pub fn match_option(answer: &str, options: &[String]) -> Option<String> {
    let wanted = answer.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }

    if let Some(exact) = options.iter().find(|o| o.trim().to_lowercase() == wanted) {
        return Some(exact.clone());
    }

    if let Some(flag) = parse_bool(answer) {
        let labels: &[&str] = if flag { &["yes", "true"] } else { &["no", "false"] };
        let is_label = |o: &&String| labels.contains(&o.trim().to_lowercase().as_str());
        if let Some(o) = options.iter().find(is_label) {
            return Some(o.clone());
        }
    }

    let containing: Vec<_> = options
        .iter()
        .filter(|o| o.to_lowercase().contains(&wanted))
        .collect();
    if let [only] = containing.as_slice() {
        return Some((*only).clone());
    }

    options
        .iter()
        .map(|o| (o, strsim::normalized_levenshtein(&wanted, &o.trim().to_lowercase())))
        .filter(|(_, score)| *score > FUZZY_OPTION_FLOOR)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(o, _)| o.clone())
}

/// Read a yes/no answer from its first word.
pub fn parse_bool(answer: &str) -> Option<bool> {
    let first = answer
        .trim()
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.' || c == '!')
        .next()?
        .to_lowercase();
    match first.as_str() {
        "yes" | "y" | "true" | "1" => Some(true),
        "no" | "n" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// --- In-memory form ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormEvent {
    pub selector: String,
    pub kind: &'static str,
}

/// A form parsed from static HTML that records every write and the events a
/// browser would fire for it.
pub struct MemoryForm {
    document: Html,
    values: RefCell<HashMap<String, String>>,
    events: RefCell<Vec<FormEvent>>,
    rejecting: RefCell<Vec<String>>,
}

impl MemoryForm {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
            values: RefCell::new(HashMap::new()),
            events: RefCell::new(Vec::new()),
            rejecting: RefCell::new(Vec::new()),
        }
    }

    /// Make a control silently discard writes, as some sites do.
    pub fn reject_writes(&self, selector: &str) {
        self.rejecting.borrow_mut().push(selector.to_string());
    }

    pub fn events(&self) -> Vec<FormEvent> {
        self.events.borrow().clone()
    }

    /// Current value of a control, if it exists.
    pub fn value(&self, selector: &str) -> Option<String> {
        self.inspect(selector).map(|f| f.value)
    }

    fn matches(&self, selector: &str) -> Vec<ElementRef<'_>> {
        match Selector::parse(selector) {
            Ok(s) => self.document.select(&s).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn inspect(&self, selector: &str) -> Option<FieldInfo> {
        let matched = self.matches(selector);
        let first = *matched.first()?;
        let el = first.value();
        let input_type = el.attr("type").map(|t| t.to_lowercase());

        let (kind, initial, options) = match (el.name(), input_type.as_deref()) {
            ("input", Some("radio")) => {
                let root = self.document.root_element();
                let labels: Vec<_> = matched.iter().filter_map(|r| radio_label(root, *r)).collect();
                let checked = matched
                    .iter()
                    .find(|r| r.value().attr("checked").is_some())
                    .and_then(|r| radio_label(root, *r))
                    .unwrap_or_default();
                (FieldKind::Radio, checked, labels)
            }
            ("input", Some("checkbox")) => {
                let checked = if el.attr("checked").is_some() { CHECKED } else { "" };
                (FieldKind::Checkbox, checked.to_string(), Vec::new())
            }
            ("input", Some("number")) => {
                let value = el.attr("value").unwrap_or_default().to_string();
                (FieldKind::Number, value, Vec::new())
            }
            ("select", _) => {
                let all = dom::select_within(first, "option");
                let selected = all
                    .iter()
                    .find(|o| o.value().attr("selected").is_some())
                    .map(|o| dom::element_text(*o))
                    .filter(|t| !parse::is_placeholder_option(t))
                    .unwrap_or_default();
                let options = all
                    .into_iter()
                    .map(dom::element_text)
                    .filter(|o| !parse::is_placeholder_option(o))
                    .collect();
                (FieldKind::Select, selected, options)
            }
            ("textarea", _) => (FieldKind::TextArea, first.text().collect::<String>(), Vec::new()),
            _ => (FieldKind::Text, el.attr("value").unwrap_or_default().to_string(), Vec::new()),
        };

        let value = self.values.borrow().get(selector).cloned().unwrap_or(initial);
        Some(FieldInfo {
            kind,
            value,
            enabled: el.attr("disabled").is_none(),
            options,
        })
    }

    fn write(&self, selector: &str, value: String, events: &[&'static str]) -> Result<()> {
        if self.inspect(selector).is_none() {
            return Err(anyhow!("No element matches {}", selector));
        }
        let mut log = self.events.borrow_mut();
        log.extend(events.iter().map(|kind| FormEvent {
            selector: selector.to_string(),
            kind: *kind,
        }));
        if !self.rejecting.borrow().iter().any(|s| s == selector) {
            self.values.borrow_mut().insert(selector.to_string(), value);
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl FormDriver for MemoryForm {
    async fn field(&self, selector: &str) -> Result<Option<FieldInfo>> {
        Ok(self.inspect(selector))
    }

    async fn clear(&self, selector: &str) -> Result<()> {
        self.write(selector, String::new(), &["input"])
    }

    async fn type_text(&self, selector: &str, chunk: &str) -> Result<()> {
        let current = self.value(selector).unwrap_or_default();
        self.write(selector, current + chunk, &["keydown", "input"])
    }

    async fn set_value(&self, selector: &str, value: &str) -> Result<()> {
        self.write(selector, value.to_string(), &["input", "change"])
    }

    async fn choose_option(&self, selector: &str, option: &str) -> Result<()> {
        let field = self
            .inspect(selector)
            .ok_or_else(|| anyhow!("No element matches {}", selector))?;
        if !field.options.iter().any(|o| o == option) {
            return Err(anyhow!("{} has no option {:?}", selector, option));
        }
        self.write(selector, option.to_string(), &["change"])
    }

    async fn set_checked(&self, selector: &str, checked: bool) -> Result<()> {
        let value = if checked { CHECKED } else { "" };
        self.write(selector, value.to_string(), &["click", "change"])
    }

    async fn read_value(&self, selector: &str) -> Result<String> {
        self.value(selector).ok_or_else(|| anyhow!("No element matches {}", selector))
    }
}
