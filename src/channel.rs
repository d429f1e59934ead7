//! Command channel between a host page (or the `serve` loop) and the
//! pipeline. Every command answers with `{success: true, ...payload}` or
//! `{success: false, error}`.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::rc::Rc;
use tracing::{debug, warn};
use url::Url;

use crate::autofill::{AutofillEngine, FormDriver};
use crate::backend::GenerationBackend;
use crate::cache::AnswerCache;
use crate::config::Config;
use crate::detector::{Detector, Registry};
use crate::dom::DomSource;
use crate::error::PipelineError;
use crate::models::{GeneratedAnswer, Profile, ScreeningQuestion};
use crate::orchestrator::{self, GenerateOptions, Orchestrator, Progress, RegenerateOptions};
use crate::sanitize::{safe_clone, sanitize_job_data};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Command {
    GetJobData,
    GetScreeningQuestions,
    GenerateAnswers {
        #[serde(default = "default_true")]
        use_cached: bool,
    },
    RegenerateAnswer {
        question_id: String,
        #[serde(default)]
        use_cached: bool,
    },
    /// Stores the current answer, or `answer` as a user edit when given.
    SaveAnswerToCache {
        question_id: String,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        rating: Option<u8>,
    },
    FillAnswers {
        #[serde(default)]
        skip_filled: Option<bool>,
        #[serde(default)]
        simulate_typing: Option<bool>,
        #[serde(default)]
        delay_ms: Option<u64>,
    },
}

fn default_true() -> bool {
    true
}

pub type ProgressSink = Box<dyn FnMut(&Progress<'_>)>;

/// Session state for one page context: the detection, its questions and the
/// answers accepted so far.
pub struct Pipeline {
    registry: Registry,
    source: Rc<dyn DomSource>,
    form: Rc<dyn FormDriver>,
    cache: AnswerCache,
    backend: Box<dyn GenerationBackend>,
    profile: Profile,
    config: Config,
    detector: Option<(Url, Detector)>,
    questions: Vec<ScreeningQuestion>,
    answers: Vec<GeneratedAnswer>,
    progress: Option<ProgressSink>,
}

impl Pipeline {
    pub fn new(
        source: Rc<dyn DomSource>,
        form: Rc<dyn FormDriver>,
        cache: AnswerCache,
        backend: Box<dyn GenerationBackend>,
        profile: Profile,
        config: Config,
    ) -> Self {
        Self {
            registry: Registry::with_defaults(),
            source,
            form,
            cache,
            backend,
            profile,
            config,
            detector: None,
            questions: Vec::new(),
            answers: Vec::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn questions(&self) -> &[ScreeningQuestion] {
        &self.questions
    }

    pub fn answers(&self) -> &[GeneratedAnswer] {
        &self.answers
    }

    pub fn cache(&self) -> &AnswerCache {
        &self.cache
    }

    /// Decode one raw message and run it. Never fails: errors come back as
    /// `{success: false, error}`.
    pub async fn handle_raw(&mut self, message: &str) -> Value {
        let decoded = serde_json::from_str::<Value>(message)
            .and_then(|raw| serde_json::from_value::<Command>(safe_clone(&raw)));
        let command = match decoded {
            Ok(command) => command,
            Err(e) => return failure(&PipelineError::Malformed(e.to_string())),
        };
        match self.handle(command).await {
            Ok(payload) => success(payload),
            Err(e) => failure(&e),
        }
    }

    pub async fn handle(&mut self, command: Command) -> Result<Value, PipelineError> {
        debug!(?command, "Handling command");
        match command {
            Command::GetJobData => {
                let detector = self.detector().await?;
                let from_cache = detector.is_cached();
                let posting = detector.detect().await?;
                let data = serde_json::to_value(&*posting).map_err(anyhow::Error::from)?;
                Ok(json!({ "jobData": sanitize_job_data(&data), "fromCache": from_cache }))
            }
            Command::GetScreeningQuestions => {
                self.load_questions().await?;
                let questions =
                    serde_json::to_value(&self.questions).map_err(anyhow::Error::from)?;
                Ok(json!({ "questions": sanitize_job_data(&questions) }))
            }
            Command::GenerateAnswers { use_cached } => {
                if self.questions.is_empty() {
                    self.load_questions().await?;
                }
                let mut run = Orchestrator::new(
                    &self.cache,
                    self.backend.as_ref(),
                    &self.profile,
                    self.questions.clone(),
                )?
                .with_max_tokens(self.config.backend.max_tokens);
                let mut ignore = |_: &Progress<'_>| {};
                let on_progress: &mut dyn FnMut(&Progress<'_>) = match self.progress.as_mut() {
                    Some(sink) => sink.as_mut(),
                    None => &mut ignore,
                };
                let outcome = run
                    .generate_all(GenerateOptions { use_cached }, on_progress)
                    .await?;
                self.answers = outcome.answers.clone();
                Ok(serde_json::to_value(&outcome).map_err(anyhow::Error::from)?)
            }
            Command::RegenerateAnswer { question_id, use_cached } => {
                let mut run = Orchestrator::new(
                    &self.cache,
                    self.backend.as_ref(),
                    &self.profile,
                    self.questions.clone(),
                )?
                .with_max_tokens(self.config.backend.max_tokens);
                let answer = run
                    .regenerate(&question_id, &mut self.answers, RegenerateOptions { use_cached })
                    .await?;
                Ok(json!({
                    "answer": answer,
                    "statistics": orchestrator::statistics(&self.questions, &self.answers),
                }))
            }
            Command::SaveAnswerToCache { question_id, answer, rating } => {
                let question = self
                    .questions
                    .iter()
                    .find(|q| q.id == question_id)
                    .ok_or_else(|| PipelineError::UnknownQuestion(question_id.clone()))?;
                if let Some(text) = answer {
                    orchestrator::apply_edit(
                        &self.questions,
                        &mut self.answers,
                        &question_id,
                        &text,
                    )?;
                }
                let text = self
                    .answers
                    .iter()
                    .find(|a| a.question_id == question_id)
                    .map(|a| a.answer.clone())
                    .ok_or_else(|| {
                        PipelineError::Malformed(format!("No answer to save for {}", question_id))
                    })?;
                let cached = self.cache.save(question, &text, rating)?;
                Ok(json!({ "cached": cached }))
            }
            Command::FillAnswers { skip_filled, simulate_typing, delay_ms } => {
                if self.answers.is_empty() {
                    return Err(PipelineError::Malformed("No answers to fill".to_string()));
                }
                orchestrator::validate_answers(&self.questions, &self.answers)?;
                let mut options = self.config.fill_options();
                if let Some(skip) = skip_filled {
                    options.skip_filled = skip;
                }
                if let Some(simulate) = simulate_typing {
                    options.simulate_typing = simulate;
                }
                if let Some(delay) = delay_ms {
                    options.delay_ms = delay;
                }
                let report = AutofillEngine::new(self.form.as_ref())
                    .fill_answers(&self.questions, &self.answers, options)
                    .await;
                // The page changed under the memoized posting.
                if let Some((_, detector)) = self.detector.as_mut() {
                    detector.invalidate();
                }
                Ok(serde_json::to_value(&report).map_err(anyhow::Error::from)?)
            }
        }
    }

    /// The detector for the page currently shown. A new one is built when
    /// the page URL changes.
    async fn detector(&mut self) -> Result<&mut Detector, PipelineError> {
        let url = self.source.current_url().await?;
        let stale = !matches!(&self.detector, Some((seen, _)) if *seen == url);
        if stale {
            let board = self
                .registry
                .resolve(&url)
                .ok_or_else(|| PipelineError::NotJobBoard(url.to_string()))?;
            let name = board.name();
            let detector =
                Detector::new(board, Rc::clone(&self.source), self.config.detector.ttl());
            if !detector.is_job_board().await? {
                return Err(PipelineError::NotJobBoard(url.to_string()));
            }
            debug!(board = name, %url, "Detector bound to page");
            self.detector = Some((url.clone(), detector));
        }
        self.detector
            .as_mut()
            .map(|(_, d)| d)
            .ok_or_else(|| PipelineError::NotJobBoard(url.to_string()))
    }

    async fn load_questions(&mut self) -> Result<(), PipelineError> {
        let questions = self.detector().await?.screening_questions().await?;
        if questions.is_empty() {
            warn!("No screening questions on this page");
            return Err(PipelineError::NoQuestions);
        }
        if questions != self.questions {
            self.answers.clear();
        }
        self.questions = questions;
        Ok(())
    }
}

fn success(payload: Value) -> Value {
    let mut out = Map::new();
    out.insert("success".to_string(), Value::Bool(true));
    if let Value::Object(fields) = payload {
        out.extend(fields);
    }
    Value::Object(out)
}

fn failure(error: &PipelineError) -> Value {
    json!({ "success": false, "error": error.to_string() })
}
