use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, GenerationBackend, GenerationRequest};
use crate::cache::AnswerCache;
use crate::error::PipelineError;
use crate::models::{GeneratedAnswer, Profile, QuestionFailure, RunStatistics, ScreeningQuestion};
use crate::sanitize::{sanitize_answer, sanitize_user_profile, validate_input};

pub const DEFAULT_MAX_TOKENS: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Complete,
    Failed,
}

/// Bookkeeping for the run in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRun {
    pub state: RunState,
    pub total: usize,
    pub current: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub current: usize,
    pub total: usize,
    pub question: &'a ScreeningQuestion,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub use_cached: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self { use_cached: true }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegenerateOptions {
    pub use_cached: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub answers: Vec<GeneratedAnswer>,
    pub failures: Vec<QuestionFailure>,
    pub statistics: RunStatistics,
}

/// One generation run over the questions of a single detection. Build a new
/// one per run; nothing here outlives it.
pub struct Orchestrator<'a> {
    cache: &'a AnswerCache,
    backend: &'a dyn GenerationBackend,
    profile: Value,
    questions: Vec<ScreeningQuestion>,
    max_tokens: u32,
    run: GenerationRun,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        cache: &'a AnswerCache,
        backend: &'a dyn GenerationBackend,
        profile: &Profile,
        questions: Vec<ScreeningQuestion>,
    ) -> Result<Self, PipelineError> {
        let raw = serde_json::to_value(profile).context("Failed to serialize profile")?;
        Ok(Self {
            cache,
            backend,
            profile: sanitize_user_profile(&raw),
            run: GenerationRun {
                state: RunState::Idle,
                total: questions.len(),
                current: 0,
            },
            questions,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn run(&self) -> &GenerationRun {
        &self.run
    }

    /// Answer every question in order. Cache hits skip the backend when
    /// `use_cached` is set. A question whose backend call fails is left
    /// unanswered and listed in `failures`; an unreachable backend fails the
    /// whole run and drops whatever was produced so far.
    pub async fn generate_all(
        &mut self,
        options: GenerateOptions,
        on_progress: &mut dyn FnMut(&Progress<'_>),
    ) -> Result<GenerationOutcome, PipelineError> {
        self.run = GenerationRun {
            state: RunState::Running,
            total: self.questions.len(),
            current: 0,
        };
        info!(
            total = self.run.total,
            use_cached = options.use_cached,
            backend = self.backend.name(),
            "Generating answers"
        );

        let mut answers = Vec::with_capacity(self.questions.len());
        let mut failures = Vec::new();

        for (index, question) in self.questions.iter().enumerate() {
            let cached = if options.use_cached { self.from_cache(question) } else { None };

            match cached {
                Some(answer) => answers.push(answer),
                None => match self.ask_backend(question).await {
                    Ok(answer) => answers.push(answer),
                    Err(PipelineError::BackendUnreachable(reason)) => {
                        self.run.state = RunState::Failed;
                        warn!(
                            question = %question.id,
                            %reason,
                            "Backend unreachable, abandoning run"
                        );
                        return Err(PipelineError::BackendUnreachable(reason));
                    }
                    Err(e) => {
                        warn!(question = %question.id, error = %e, "No answer generated");
                        failures.push(QuestionFailure {
                            question_id: question.id.clone(),
                            reason: e.to_string(),
                        });
                    }
                },
            }

            self.run.current = index + 1;
            on_progress(&Progress {
                current: self.run.current,
                total: self.run.total,
                question,
            });
        }

        self.run.state = RunState::Complete;
        let statistics = statistics(&self.questions, &answers);
        info!(
            generated = statistics.generated,
            from_cache = statistics.from_cache,
            failed = failures.len(),
            "Generation finished"
        );
        Ok(GenerationOutcome {
            answers,
            failures,
            statistics,
        })
    }

    /// Produce a fresh answer for one question and swap it into `answers`,
    /// appending when the question had none yet.
    pub async fn regenerate(
        &mut self,
        question_id: &str,
        answers: &mut Vec<GeneratedAnswer>,
        options: RegenerateOptions,
    ) -> Result<GeneratedAnswer, PipelineError> {
        let question = self
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .ok_or_else(|| PipelineError::UnknownQuestion(question_id.to_string()))?;

        let cached = if options.use_cached { self.from_cache(question) } else { None };
        let answer = match cached {
            Some(answer) => answer,
            None => self.ask_backend(question).await?,
        };

        match answers.iter_mut().find(|a| a.question_id == question_id) {
            Some(slot) => *slot = answer.clone(),
            None => answers.push(answer.clone()),
        }
        Ok(answer)
    }

    fn from_cache(&self, question: &ScreeningQuestion) -> Option<GeneratedAnswer> {
        match self.cache.best_match(&question.text, question.question_type) {
            Ok(Some(hit)) => {
                debug!(
                    question = %question.id,
                    cache_id = hit.answer.id,
                    similarity = hit.similarity,
                    "Cache hit"
                );
                Some(GeneratedAnswer {
                    question_id: question.id.clone(),
                    answer: fit_answer(question, &hit.answer.answer_text),
                    from_cache: true,
                    cache_id: Some(hit.answer.id),
                    similarity: Some(hit.similarity),
                    confidence: None,
                    token_count: None,
                    user_edited: false,
                })
            }
            Ok(None) => {
                debug!(question = %question.id, "Cache miss");
                None
            }
            Err(e) => {
                warn!(question = %question.id, error = %e, "Cache lookup failed, asking backend");
                None
            }
        }
    }

    async fn ask_backend(
        &self,
        question: &ScreeningQuestion,
    ) -> Result<GeneratedAnswer, PipelineError> {
        let request = GenerationRequest::new(question, &self.profile, self.max_tokens);
        let reply = self.backend.generate(&request).await.map_err(|source| match source {
            BackendError::Unreachable(reason) => PipelineError::BackendUnreachable(reason),
            source => PipelineError::Generation {
                question_id: question.id.clone(),
                source,
            },
        })?;

        Ok(GeneratedAnswer {
            question_id: question.id.clone(),
            answer: fit_answer(question, &reply.answer),
            from_cache: false,
            cache_id: None,
            similarity: None,
            confidence: reply.confidence,
            token_count: reply.token_count,
            user_edited: false,
        })
    }
}

/// Sanitized answer text, cut to the question's `max_length`.
fn fit_answer(question: &ScreeningQuestion, text: &str) -> String {
    let answer = sanitize_answer(text);
    match question.max_length {
        Some(max) => truncate_chars(&answer, max),
        None => answer,
    }
}

/// Replace an answer with the user's own text. Creates the answer if the
/// question had none.
pub fn apply_edit(
    questions: &[ScreeningQuestion],
    answers: &mut Vec<GeneratedAnswer>,
    question_id: &str,
    text: &str,
) -> Result<GeneratedAnswer, PipelineError> {
    if !questions.iter().any(|q| q.id == question_id) {
        return Err(PipelineError::UnknownQuestion(question_id.to_string()));
    }
    let check = validate_input(text);
    if !check.valid {
        warn!(
            question = question_id,
            reason = %check.reason,
            "Edited answer looks like an injection attempt"
        );
    }
    let text = sanitize_answer(text);
    let answer = match answers.iter_mut().find(|a| a.question_id == question_id) {
        Some(existing) => {
            existing.answer = text;
            existing.user_edited = true;
            existing.clone()
        }
        None => {
            let created = GeneratedAnswer {
                question_id: question_id.to_string(),
                answer: text,
                from_cache: false,
                cache_id: None,
                similarity: None,
                confidence: None,
                token_count: None,
                user_edited: true,
            };
            answers.push(created.clone());
            created
        }
    };
    Ok(answer)
}

/// Every answer must belong to a question of the same detection.
pub fn validate_answers(
    questions: &[ScreeningQuestion],
    answers: &[GeneratedAnswer],
) -> Result<(), PipelineError> {
    match answers.iter().find(|a| !questions.iter().any(|q| q.id == a.question_id)) {
        Some(stray) => Err(PipelineError::UnknownQuestion(stray.question_id.clone())),
        None => Ok(()),
    }
}

pub fn statistics(questions: &[ScreeningQuestion], answers: &[GeneratedAnswer]) -> RunStatistics {
    let mut by_type = BTreeMap::new();
    for answer in answers {
        if let Some(q) = questions.iter().find(|q| q.id == answer.question_id) {
            *by_type.entry(q.question_type).or_insert(0) += 1;
        }
    }

    let confidences: Vec<f64> = answers.iter().filter_map(|a| a.confidence).collect();
    let average_confidence = if confidences.is_empty() {
        None
    } else {
        Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
    };

    RunStatistics {
        total_questions: questions.len(),
        generated: answers.len(),
        from_cache: answers.iter().filter(|a| a.from_cache).count(),
        user_edited: answers.iter().filter(|a| a.user_edited).count(),
        total_tokens: answers.iter().filter_map(|a| a.token_count).map(u64::from).sum(),
        average_confidence,
        by_type,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendAnswer;
    use crate::detector::parse::question_id;
    use crate::models::QuestionType;
    use async_trait::async_trait;
    use std::cell::RefCell;

    enum Reply {
        Answer(&'static str, f64, u32),
        Fail,
        Down,
    }

    /// Answers by question text; records every question it was asked.
    struct ScriptedBackend {
        replies: Vec<(&'static str, Reply)>,
        asked: RefCell<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<(&'static str, Reply)>) -> Self {
            Self {
                replies,
                asked: RefCell::new(Vec::new()),
            }
        }
    }

    #[async_trait(?Send)]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(
            &self,
            request: &GenerationRequest<'_>,
        ) -> Result<BackendAnswer, BackendError> {
            self.asked.borrow_mut().push(request.question.text.to_string());
            let reply = self
                .replies
                .iter()
                .find(|(text, _)| *text == request.question.text)
                .map(|(_, r)| r);
            match reply {
                Some(Reply::Answer(answer, confidence, tokens)) => Ok(BackendAnswer {
                    answer: answer.to_string(),
                    confidence: Some(*confidence),
                    token_count: Some(*tokens),
                }),
                Some(Reply::Fail) => Err(BackendError::Status {
                    status: 500,
                    body: "model overloaded".to_string(),
                }),
                Some(Reply::Down) => {
                    Err(BackendError::Unreachable("connection refused".to_string()))
                }
                None => Err(BackendError::Empty),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn question(position: usize, text: &str, question_type: QuestionType) -> ScreeningQuestion {
        ScreeningQuestion {
            id: question_id(position, text),
            text: text.to_string(),
            question_type,
            is_required: true,
            max_length: None,
            options: None,
            selector: format!("#q{}", position),
        }
    }

    fn orchestrator<'a>(
        cache: &'a AnswerCache,
        backend: &'a ScriptedBackend,
        questions: Vec<ScreeningQuestion>,
    ) -> Orchestrator<'a> {
        Orchestrator::new(cache, backend, &Profile::default(), questions).unwrap()
    }

    fn five_questions() -> Vec<ScreeningQuestion> {
        vec![
            question(0, "How many years of Rust experience do you have?", QuestionType::Numeric),
            question(1, "Are you authorized to work in the United States?", QuestionType::Boolean),
            question(2, "Why do you want to join our team?", QuestionType::Text),
            question(3, "What is your expected salary?", QuestionType::Text),
            question(4, "Describe a difficult bug you fixed.", QuestionType::Text),
        ]
    }

    fn full_backend() -> ScriptedBackend {
        ScriptedBackend::new(vec![
            ("How many years of Rust experience do you have?", Reply::Answer("6", 0.9, 3)),
            ("Are you authorized to work in the United States?", Reply::Answer("Yes", 0.95, 2)),
            ("Why do you want to join our team?", Reply::Answer("The <b>mission</b>.", 0.7, 40)),
            ("What is your expected salary?", Reply::Answer("$150,000", 0.6, 8)),
            (
                "Describe a difficult bug you fixed.",
                Reply::Answer("A race in a file watcher.", 0.8, 30),
            ),
        ])
    }

    #[tokio::test]
    async fn test_generate_all_mixes_cache_hits_and_backend_answers() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let questions = five_questions();
        cache.save(&questions[1], "Yes", Some(5)).unwrap();
        cache.save(&questions[3], "$140,000", None).unwrap();

        let backend = full_backend();
        let mut orchestrator = orchestrator(&cache, &backend, questions.clone());
        let mut seen = Vec::new();
        let mut record = |p: &Progress<'_>| seen.push((p.current, p.total, p.question.id.clone()));
        let outcome = orchestrator
            .generate_all(GenerateOptions { use_cached: true }, &mut record)
            .await
            .unwrap();

        let ids: Vec<_> = outcome.answers.iter().map(|a| a.question_id.clone()).collect();
        let expected: Vec<_> = questions.iter().map(|q| q.id.clone()).collect();
        assert_eq!(ids, expected);

        let cached: Vec<bool> = outcome.answers.iter().map(|a| a.from_cache).collect();
        assert_eq!(cached, vec![false, true, false, true, false]);
        assert_eq!(outcome.answers[1].similarity, Some(1.0));
        assert!(outcome.answers[1].cache_id.is_some());
        assert_eq!(outcome.answers[3].answer, "$140,000");
        assert_eq!(backend.asked.borrow().len(), 3);

        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen[4], (5, 5, questions[4].id.clone()));

        assert_eq!(orchestrator.run().state, RunState::Complete);
        assert_eq!(outcome.statistics.from_cache, 2);
        assert_eq!(outcome.statistics.generated, 5);
    }

    #[tokio::test]
    async fn test_use_cached_false_always_asks_backend() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let questions = five_questions();
        cache.save(&questions[1], "No", None).unwrap();
        let backend = full_backend();
        let mut orchestrator = orchestrator(&cache, &backend, questions);
        let outcome = orchestrator
            .generate_all(GenerateOptions { use_cached: false }, &mut |_| {})
            .await
            .unwrap();
        assert!(outcome.answers.iter().all(|a| !a.from_cache));
        assert_eq!(outcome.answers[1].answer, "Yes");
        assert_eq!(backend.asked.borrow().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_question_is_left_unanswered() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let questions = five_questions();
        let backend = ScriptedBackend::new(vec![
            ("How many years of Rust experience do you have?", Reply::Answer("6", 0.9, 3)),
            ("Are you authorized to work in the United States?", Reply::Answer("Yes", 0.95, 2)),
            ("Why do you want to join our team?", Reply::Fail),
            ("What is your expected salary?", Reply::Answer("$150,000", 0.6, 8)),
            ("Describe a difficult bug you fixed.", Reply::Answer("A race.", 0.8, 30)),
        ]);
        let mut orchestrator = orchestrator(&cache, &backend, questions.clone());
        let mut calls = 0;
        let outcome = orchestrator
            .generate_all(GenerateOptions::default(), &mut |_| calls += 1)
            .await
            .unwrap();

        let ids: Vec<_> = outcome.answers.iter().map(|a| a.question_id.clone()).collect();
        let expected: Vec<_> = [0, 1, 3, 4].iter().map(|&i| questions[i].id.clone()).collect();
        assert_eq!(ids, expected);
        assert_eq!(outcome.statistics.generated, 4);
        assert_eq!(outcome.statistics.total_questions, 5);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].question_id, questions[2].id);
        assert!(outcome.failures[0].reason.contains("model overloaded"));
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_the_run() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let questions = five_questions();
        let backend = ScriptedBackend::new(vec![
            ("How many years of Rust experience do you have?", Reply::Answer("6", 0.9, 3)),
            ("Are you authorized to work in the United States?", Reply::Down),
        ]);
        let mut orchestrator = orchestrator(&cache, &backend, questions);
        let result = orchestrator.generate_all(GenerateOptions::default(), &mut |_| {}).await;
        assert!(matches!(result, Err(PipelineError::BackendUnreachable(_))));
        assert_eq!(orchestrator.run().state, RunState::Failed);
        assert_eq!(orchestrator.run().current, 1);
    }

    #[tokio::test]
    async fn test_answers_are_sanitized_and_truncated() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let mut q = question(0, "Why do you want to join our team?", QuestionType::Text);
        q.max_length = Some(6);
        let backend = full_backend();
        let mut orchestrator = orchestrator(&cache, &backend, vec![q]);
        let outcome = orchestrator
            .generate_all(GenerateOptions::default(), &mut |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.answers[0].answer, "The mi");
    }

    #[tokio::test]
    async fn test_cache_hits_are_truncated_too() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let mut q = question(0, "Why do you want to join our team?", QuestionType::Text);
        cache.save(&q, "The mission, mostly.", None).unwrap();
        q.max_length = Some(6);
        let backend = full_backend();
        let mut orchestrator = orchestrator(&cache, &backend, vec![q]);
        let outcome = orchestrator
            .generate_all(GenerateOptions::default(), &mut |_| {})
            .await
            .unwrap();
        assert!(outcome.answers[0].from_cache);
        assert_eq!(outcome.answers[0].answer, "The mi");
        assert!(backend.asked.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_replaces_in_place_and_bypasses_cache() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let questions = five_questions();
        cache.save(&questions[0], "4", None).unwrap();
        let backend = full_backend();
        let mut orchestrator = orchestrator(&cache, &backend, questions.clone());
        let mut answers = orchestrator
            .generate_all(GenerateOptions::default(), &mut |_| {})
            .await
            .unwrap()
            .answers;
        assert!(answers[0].from_cache);

        let fresh = orchestrator
            .regenerate(&questions[0].id, &mut answers, RegenerateOptions::default())
            .await
            .unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(fresh.answer, "6");
        assert_eq!(answers.len(), 5);
        assert_eq!(answers[0], fresh);
    }

    #[tokio::test]
    async fn test_regenerate_unknown_question_is_rejected() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let backend = full_backend();
        let mut orchestrator = orchestrator(&cache, &backend, five_questions());
        let mut answers = Vec::new();
        let err = orchestrator
            .regenerate("q9-nope", &mut answers, RegenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownQuestion(id) if id == "q9-nope"));
        assert!(backend.asked.borrow().is_empty());
    }

    #[test]
    fn test_apply_edit_and_validate() {
        let questions = five_questions();
        let mut answers = Vec::new();
        let text = "Because <script>x</script>I care";
        let edited = apply_edit(&questions, &mut answers, &questions[2].id, text).unwrap();
        assert!(edited.user_edited);
        assert_eq!(edited.answer, "Because I care");
        assert_eq!(answers.len(), 1);

        assert!(apply_edit(&questions, &mut answers, "q7-stray", "x").is_err());
        assert!(validate_answers(&questions, &answers).is_ok());

        answers.push(GeneratedAnswer {
            question_id: "q7-stray".to_string(),
            ..answers[0].clone()
        });
        assert!(matches!(
            validate_answers(&questions, &answers),
            Err(PipelineError::UnknownQuestion(_))
        ));
    }

    #[test]
    fn test_statistics_excludes_missing_confidence() {
        let questions = five_questions();
        let answer = |i: usize, from_cache: bool, confidence: Option<f64>, tokens: Option<u32>| {
            GeneratedAnswer {
                question_id: questions[i].id.clone(),
                answer: "x".to_string(),
                from_cache,
                cache_id: None,
                similarity: None,
                confidence,
                token_count: tokens,
                user_edited: false,
            }
        };
        let answers = vec![
            answer(0, false, Some(0.9), Some(10)),
            answer(1, true, None, None),
            answer(2, false, Some(0.5), Some(20)),
        ];
        let stats = statistics(&questions, &answers);
        assert_eq!(stats.total_questions, 5);
        assert_eq!(stats.generated, 3);
        assert_eq!(stats.from_cache, 1);
        assert_eq!(stats.total_tokens, 30);
        assert!((stats.average_confidence.unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(stats.by_type.get(&QuestionType::Text), Some(&1));
        assert_eq!(stats.by_type.get(&QuestionType::Numeric), Some(&1));

        assert_eq!(statistics(&questions, &[]).average_confidence, None);
    }
}
