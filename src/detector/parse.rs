//! Pure text parsers shared by the job-board detectors. None of these touch
//! the page and none of them fail: unrecognised input maps to `None`.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::models::{JobType, QuestionType, SalaryRange, Seniority};

static REMOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(remote|work[\s-]+from[\s-]+home|wfh)\b").expect("static regex")
});

static LEADING_INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d[\d,]*)").expect("static regex"));

// "$120,000 - $150,000", "$150K/yr - $190K/yr", "£40k to £50k", "USD 90,000 - 110,000"
static SALARY_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<cur>[$£€]|usd|eur|gbp|cad)\s?(?P<min>\d[\d,.]*)\s*(?P<mink>k)?(?:\s*/\s*[a-z]+)?\s*(?:-|–|—|to)\s*(?:[$£€]|usd|eur|gbp|cad)?\s?(?P<max>\d[\d,.]*)\s*(?P<maxk>k)?",
    )
    .expect("static regex")
});

static SALARY_SINGLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<cur>[$£€]|usd|eur|gbp|cad)\s?(?P<amount>\d[\d,.]*)\s*(?P<k>k)?")
        .expect("static regex")
});

static JOB_TYPE_RULES: LazyLock<Vec<(Regex, JobType)>> = LazyLock::new(|| {
    [
        (r"(?i)\bfull[\s-]?time\b", JobType::FullTime),
        (r"(?i)\bpart[\s-]?time\b", JobType::PartTime),
        (r"(?i)\binternship\b|\bintern\b", JobType::Internship),
        (r"(?i)\b(contract|contractor|freelance)\b", JobType::Contract),
        (r"(?i)\b(temporary|temp)\b", JobType::Temporary),
        (r"(?i)\bvolunteer\b", JobType::Volunteer),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("static regex"), kind))
    .collect()
});

// Most senior first so "Senior Director" lands on Director.
static SENIORITY_RULES: LazyLock<Vec<(Regex, Seniority)>> = LazyLock::new(|| {
    [
        (r"(?i)\b(executive|vp|vice president|chief|c-level|cto|ceo)\b", Seniority::Executive),
        (r"(?i)\bdirector\b", Seniority::Director),
        (r"(?i)\b(mid[\s-]?senior|senior|sr\.?|lead|staff|principal)\b", Seniority::MidSenior),
        (r"(?i)\bassociate\b", Seniority::Associate),
        (r"(?i)\b(entry[\s-]?level|junior|jr\.?|graduate)\b", Seniority::EntryLevel),
        (r"(?i)\b(internship|intern)\b", Seniority::Internship),
    ]
    .into_iter()
    .map(|(pattern, level)| (Regex::new(pattern).expect("static regex"), level))
    .collect()
});

pub fn parse_job_type(text: &str) -> Option<JobType> {
    if text.trim().is_empty() {
        return None;
    }
    JOB_TYPE_RULES
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, kind)| *kind)
}

pub fn parse_seniority(text: &str) -> Option<Seniority> {
    if text.trim().is_empty() {
        return None;
    }
    SENIORITY_RULES
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, level)| *level)
}

/// First integer in an applicant-count label: "50 applicants" -> 50,
/// "Over 100 applicants" -> 100, "1,204 applicants" -> 1204.
pub fn parse_applicant_count(text: &str) -> Option<u32> {
    let caps = LEADING_INT_RE.captures(text)?;
    caps[1].replace(',', "").parse().ok()
}

pub fn is_remote(location: &str, description: &str) -> bool {
    REMOTE_RE.is_match(location) || REMOTE_RE.is_match(description)
}

/// Parse a salary banner into a range. Anything that does not contain a
/// currency-marked amount yields `None`, never a half-filled range.
pub fn parse_salary(text: &str) -> Option<SalaryRange> {
    let raw = text.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(caps) = SALARY_RANGE_RE.captures(raw) {
        let currency = currency_code(&caps["cur"])?;
        // "120 - 150k" puts the unit on the upper bound only
        let thousands = caps.name("mink").is_some() || caps.name("maxk").is_some();
        let min = parse_amount(&caps["min"], thousands)?;
        let max = parse_amount(&caps["max"], caps.name("maxk").is_some())?;
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        return Some(SalaryRange {
            min,
            max,
            currency,
            raw: raw.to_string(),
        });
    }

    let caps = SALARY_SINGLE_RE.captures(raw)?;
    let currency = currency_code(&caps["cur"])?;
    let amount = parse_amount(&caps["amount"], caps.name("k").is_some())?;
    Some(SalaryRange {
        min: amount,
        max: amount,
        currency,
        raw: raw.to_string(),
    })
}

fn currency_code(marker: &str) -> Option<String> {
    let code = match marker.to_lowercase().as_str() {
        "$" | "usd" => "USD",
        "£" | "gbp" => "GBP",
        "€" | "eur" => "EUR",
        "cad" => "CAD",
        _ => return None,
    };
    Some(code.to_string())
}

fn parse_amount(digits: &str, thousands: bool) -> Option<f64> {
    let digits = digits.trim_end_matches(['.', ',']);
    // "55.000" is a European thousands separator, "45.50" is a decimal.
    let normalized = match digits.rfind('.') {
        Some(idx) if digits.len() - idx - 1 == 3 => digits.replace(['.', ','], ""),
        _ => digits.replace(',', ""),
    };
    let value: f64 = normalized.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some(if thousands { value * 1000.0 } else { value })
}

/// Lower-cased, punctuation-free, whitespace-collapsed form of a question.
pub fn question_signature(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic id from form position and normalized text, so re-reading
/// the same form yields the same ids.
pub fn question_id(position: usize, text: &str) -> String {
    let digest = Sha256::digest(question_signature(text).as_bytes());
    format!("q{}-{}", position, &hex::encode(digest)[..10])
}

/// Infer the question type from a control's tag, input type and options.
pub fn infer_question_type(
    tag: &str,
    input_type: Option<&str>,
    options: &[String],
) -> QuestionType {
    let yes_no = !options.is_empty()
        && options.len() <= 2
        && options
            .iter()
            .all(|o| matches!(o.trim().to_lowercase().as_str(), "yes" | "no"));
    match (tag, input_type.map(|t| t.to_lowercase())) {
        ("select", _) if yes_no => QuestionType::Boolean,
        ("select", _) => QuestionType::Select,
        (_, Some(t)) if t == "radio" && yes_no => QuestionType::Boolean,
        (_, Some(t)) if t == "radio" => QuestionType::Select,
        (_, Some(t)) if t == "checkbox" => QuestionType::Boolean,
        (_, Some(t)) if t == "number" => QuestionType::Numeric,
        _ => QuestionType::Text,
    }
}

/// Placeholder entries that some boards put at the top of a dropdown.
pub fn is_placeholder_option(option: &str) -> bool {
    let lower = option.trim().to_lowercase();
    lower.is_empty()
        || lower.starts_with("select")
        || lower == "--"
        || lower.starts_with("please select")
}
