use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryRange {
    pub min: f64,
    pub max: f64,
    pub currency: String, // ISO code: "USD", "EUR", "GBP", "CAD"
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "Full-time")]
    FullTime,
    #[serde(rename = "Part-time")]
    PartTime,
    Contract,
    Temporary,
    Internship,
    Volunteer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Seniority {
    Internship,
    #[serde(rename = "Entry level")]
    EntryLevel,
    Associate,
    #[serde(rename = "Mid-Senior level")]
    MidSenior,
    Director,
    Executive,
}

/// Structured job data read from a job-detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPosting {
    pub title: String,
    pub company: String,
    pub location: String,
    pub salary_range: Option<SalaryRange>,
    pub job_type: Option<JobType>,
    pub seniority: Option<Seniority>,
    pub remote: bool,
    pub skills: BTreeSet<String>,
    pub applicant_count: Option<u32>,
    pub posted_date: Option<String>,
    pub description: String,
    pub application_url: String,
    pub source_site: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Text,
    Boolean,
    Select,
    Numeric,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Text => "text",
            QuestionType::Boolean => "boolean",
            QuestionType::Select => "select",
            QuestionType::Numeric => "numeric",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Some(QuestionType::Text),
            "boolean" | "bool" => Some(QuestionType::Boolean),
            "select" => Some(QuestionType::Select),
            "numeric" | "number" => Some(QuestionType::Numeric),
            _ => None,
        }
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningQuestion {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub is_required: bool,
    pub max_length: Option<usize>,
    pub options: Option<Vec<String>>,
    pub selector: String, // CSS selector of the control (or radio group) on the page
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAnswer {
    pub id: i64,
    pub question_signature: String,
    pub question_text: String,
    pub answer_text: String,
    pub question_type: QuestionType,
    pub rating: Option<u8>,
    pub created_at: String,
}

/// A cache entry paired with its similarity to the query it was looked up for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMatch {
    #[serde(flatten)]
    pub answer: CachedAnswer,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedAnswer {
    pub question_id: String,
    pub answer: String,
    pub from_cache: bool,
    pub cache_id: Option<i64>,
    pub similarity: Option<f64>,
    pub confidence: Option<f64>,
    pub token_count: Option<u32>,
    #[serde(default)]
    pub user_edited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionFailure {
    pub question_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    pub total_questions: usize,
    pub generated: usize,
    pub from_cache: usize,
    pub user_edited: usize,
    pub total_tokens: u64,
    pub average_confidence: Option<f64>,
    pub by_type: BTreeMap<QuestionType, usize>,
}

/// Applicant profile sent to the generation backend alongside each question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub years_experience: Option<u32>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}
