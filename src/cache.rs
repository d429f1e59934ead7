use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::detector::parse::question_signature;
use crate::models::{CacheMatch, CachedAnswer, QuestionType, ScreeningQuestion};
use crate::sanitize::sanitize_answer;

pub const DEFAULT_SIMILARITY_FLOOR: f64 = 0.75;
const DEFAULT_MAX_RESULTS: usize = 5;

/// Store of accepted answers, looked up by question similarity. Entries are
/// only ever added; retention is left to whoever owns the database file.
pub struct AnswerCache {
    conn: Connection,
    path: Option<PathBuf>,
    similarity_floor: f64,
    max_results: usize,
}

impl AnswerCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open answer cache at {}", path.display()))?;
        let cache = Self::with_connection(conn, Some(path.to_path_buf()));
        cache.init()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self::with_connection(conn, None);
        cache.init()?;
        Ok(cache)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn,
            path,
            similarity_floor: DEFAULT_SIMILARITY_FLOOR,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_similarity_floor(mut self, floor: f64) -> Self {
        self.similarity_floor = floor.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn similarity_floor(&self) -> f64 {
        self.similarity_floor
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cached_answers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question_signature TEXT NOT NULL,
                question_text TEXT NOT NULL,
                answer_text TEXT NOT NULL,
                question_type TEXT NOT NULL
                    CHECK (question_type IN ('text', 'boolean', 'select', 'numeric')),
                rating INTEGER CHECK (rating IS NULL OR rating BETWEEN 1 AND 5),
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_answers_type ON cached_answers(question_type);
            "#,
        )?;
        Ok(())
    }

    /// Answers to questions of the same type whose signature clears the
    /// similarity floor, best match first; ties go to the newer entry.
    pub fn lookup(&self, question: &str, question_type: QuestionType) -> Result<Vec<CacheMatch>> {
        let signature = question_signature(question);
        if signature.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, question_signature, question_text, answer_text, question_type, rating, created_at
             FROM cached_answers WHERE question_type = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([question_type.as_str()], Self::row_to_answer)?;

        let mut matches = Vec::new();
        for row in rows {
            let answer = row?;
            let similarity = similarity(&signature, &answer.question_signature);
            if similarity >= self.similarity_floor {
                matches.push(CacheMatch { answer, similarity });
            }
        }

        // Stable sort keeps the recency order among equal scores.
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(self.max_results);

        debug!(
            signature = %signature,
            question_type = %question_type,
            hits = matches.len(),
            "Answer cache lookup"
        );
        Ok(matches)
    }

    pub fn best_match(
        &self,
        question: &str,
        question_type: QuestionType,
    ) -> Result<Option<CacheMatch>> {
        Ok(self.lookup(question, question_type)?.into_iter().next())
    }

    /// Store an accepted answer. Always inserts; near-duplicates are kept.
    /// Both texts are stored sanitized; the signature is taken from the
    /// question as scraped so later lookups of the same page text match.
    pub fn save(
        &self,
        question: &ScreeningQuestion,
        answer_text: &str,
        rating: Option<u8>,
    ) -> Result<CachedAnswer> {
        let answer_text = sanitize_answer(answer_text);
        let question_text = sanitize_answer(&question.text);
        let signature = question_signature(&question.text);
        let rating = rating.map(|r| r.clamp(1, 5));
        let created_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        self.conn.execute(
            "INSERT INTO cached_answers
                 (question_signature, question_text, answer_text, question_type, rating, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                signature,
                question_text,
                answer_text,
                question.question_type.as_str(),
                rating,
                created_at
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!(id, question_id = %question.id, "Saved answer to cache");
        Ok(CachedAnswer {
            id,
            question_signature: signature,
            question_text,
            answer_text,
            question_type: question.question_type,
            rating,
            created_at,
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<CachedAnswer>> {
        let result = self.conn.query_row(
            "SELECT id, question_signature, question_text, answer_text, question_type, rating, created_at
             FROM cached_answers WHERE id = ?1",
            [id],
            Self::row_to_answer,
        );
        match result {
            Ok(answer) => Ok(Some(answer)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self, limit: usize) -> Result<Vec<CachedAnswer>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, question_signature, question_text, answer_text, question_type, rating, created_at
             FROM cached_answers ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], Self::row_to_answer)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list cached answers")
    }

    /// Returns false when no entry has this id.
    pub fn rate(&self, id: i64, rating: u8) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE cached_answers SET rating = ?1 WHERE id = ?2",
            params![rating.clamp(1, 5), id],
        )?;
        Ok(updated > 0)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cached_answers", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn row_to_answer(row: &rusqlite::Row) -> rusqlite::Result<CachedAnswer> {
        let question_type: String = row.get(4)?;
        Ok(CachedAnswer {
            id: row.get(0)?,
            question_signature: row.get(1)?,
            question_text: row.get(2)?,
            answer_text: row.get(3)?,
            question_type: QuestionType::parse(&question_type).unwrap_or(QuestionType::Text),
            rating: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

/// Similarity of two question signatures in [0, 1]: the better of token-set
/// Jaccard and Sørensen–Dice over character bigrams. Equal signatures are 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    let union = ta.union(&tb).count();
    let jaccard = if union == 0 {
        0.0
    } else {
        ta.intersection(&tb).count() as f64 / union as f64
    };
    jaccard.max(strsim::sorensen_dice(a, b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::parse::question_id;

    fn question(text: &str, question_type: QuestionType) -> ScreeningQuestion {
        ScreeningQuestion {
            id: question_id(0, text),
            text: text.to_string(),
            question_type,
            is_required: true,
            max_length: None,
            options: None,
            selector: "#q".to_string(),
        }
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("how many years", "how many years"), 1.0);
        assert_eq!(similarity("", "anything"), 0.0);
        let close = similarity(
            "how many years of experience do you have with rust",
            "how many years of rust experience do you have",
        );
        assert!(close > 0.75 && close < 1.0, "{}", close);
        let far = similarity("are you authorized to work in the us", "what is your favorite color");
        assert!(far < 0.5, "{}", far);
    }

    #[test]
    fn test_exact_match_scores_one() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let q = question("Are you authorized to work in the US?", QuestionType::Boolean);
        cache.save(&q, "Yes", Some(5)).unwrap();

        let hits = cache
            .lookup("are you AUTHORIZED to work in the US", QuestionType::Boolean)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 1.0);
        assert_eq!(hits[0].answer.answer_text, "Yes");
        assert_eq!(hits[0].answer.rating, Some(5));
    }

    #[test]
    fn test_lookup_filters_by_floor_and_type() {
        let cache = AnswerCache::open_in_memory().unwrap();
        cache
            .save(&question("Why do you want to work here?", QuestionType::Text), "Mission.", None)
            .unwrap();
        cache
            .save(&question("Are you willing to relocate?", QuestionType::Boolean), "No", None)
            .unwrap();

        let miss = |text: &str, question_type: QuestionType| {
            cache.lookup(text, question_type).unwrap().is_empty()
        };
        assert!(miss("What is your expected salary?", QuestionType::Text));
        assert!(miss("Why do you want to work here?", QuestionType::Boolean));
        assert!(cache.lookup("   ", QuestionType::Text).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_orders_by_similarity_then_recency() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let exact = question(
            "How many years of experience do you have with Rust?",
            QuestionType::Text,
        );
        let close = question("How many years of Rust experience do you have?", QuestionType::Text);

        let older_exact = cache.save(&exact, "Four", None).unwrap();
        let near = cache.save(&close, "Five", None).unwrap();
        let newer_exact = cache.save(&exact, "Six", None).unwrap();

        let hits = cache.lookup(&exact.text, QuestionType::Text).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.answer.id).collect();
        assert_eq!(ids, vec![newer_exact.id, older_exact.id, near.id]);
        assert!(hits[0].similarity >= hits[2].similarity);
    }

    #[test]
    fn test_save_sanitizes_and_allows_duplicates() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let q = question("Tell us about yourself", QuestionType::Text);
        let saved = cache.save(&q, "<script>x()</script>I build <b>tools</b>", Some(9)).unwrap();
        assert_eq!(saved.answer_text, "I build tools");
        assert_eq!(saved.rating, Some(5));

        cache.save(&q, "I build tools", None).unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.get(saved.id).unwrap().unwrap().answer_text, "I build tools");
        assert!(cache.get(9999).unwrap().is_none());
    }

    #[test]
    fn test_save_stores_plain_question_text() {
        let cache = AnswerCache::open_in_memory().unwrap();
        let q = question("<img src=x onerror=alert(1)> Why us?", QuestionType::Text);
        let saved = cache.save(&q, "Your robots.", None).unwrap();
        assert_eq!(saved.question_text, "Why us?");

        let stored = cache.get(saved.id).unwrap().unwrap();
        assert!(!stored.question_text.contains('<'));
        assert_eq!(stored.question_text, "Why us?");

        // the same scraped text still finds it
        let hits = cache.lookup(&q.text, QuestionType::Text).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[test]
    fn test_rate_and_list() {
        let cache = AnswerCache::open_in_memory().unwrap().with_max_results(1);
        let q = question("Preferred start date?", QuestionType::Text);
        let first = cache.save(&q, "ASAP", None).unwrap();
        cache.save(&q, "Two weeks", None).unwrap();

        assert!(cache.rate(first.id, 0).unwrap());
        assert_eq!(cache.get(first.id).unwrap().unwrap().rating, Some(1));
        assert!(!cache.rate(4242, 3).unwrap());

        let listed = cache.list(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].answer_text, "Two weeks");
        assert_eq!(cache.lookup(&q.text, QuestionType::Text).unwrap().len(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("answers.db");
        {
            let cache = AnswerCache::open(&path).unwrap();
            cache
                .save(&question("Do you need sponsorship?", QuestionType::Boolean), "No", None)
                .unwrap();
        }
        let cache = AnswerCache::open(&path).unwrap();
        assert_eq!(cache.path(), Some(path.as_path()));
        let hits = cache.lookup("Do you need sponsorship?", QuestionType::Boolean).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].answer.answer_text, "No");
    }
}
