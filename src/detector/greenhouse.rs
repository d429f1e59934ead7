use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use url::Url;

use super::{parse, question_from_controls, JobBoard};
use crate::dom::{self, Page};
use crate::models::{JobPosting, ScreeningQuestion};

static JOB_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[\w-]+/jobs/\d+").expect("static regex"));

const TITLE: &[&str] = &[".app-title", "h1.section-header", ".job__title h1", "h1"];
const COMPANY: &[&str] = &[".company-name", ".job__company", "meta[property='og:site_name']"];
const LOCATION: &[&str] = &[".location", ".job__location"];
const DESCRIPTION: &[&str] = &["#content", ".job__description"];
const PAY: &[&str] = &[".pay-range", ".pay-input", ".job__pay"];
const METADATA: &[&str] = &[".job__tags .tag", ".custom-field-value"];

/// Field wrappers in the embedded application form.
const QUESTION_FIELDS: &str = "#application .field, #application-form .field-wrapper, .application--questions .field";

// Standard contact fields are profile data, not screening questions.
const CONTACT_FIELDS: &[&str] = &[
    "first_name",
    "last_name",
    "email",
    "phone",
    "resume",
    "cover_letter",
];

pub struct Greenhouse;

impl JobBoard for Greenhouse {
    fn name(&self) -> &'static str {
        "greenhouse"
    }

    fn hosts(&self) -> &'static [&'static str] {
        &["boards.greenhouse.io", "job-boards.greenhouse.io"]
    }

    fn is_job_path(&self, url: &Url) -> bool {
        JOB_PATH_RE.is_match(url.path())
    }

    fn extract_job_data(&self, page: &Page) -> JobPosting {
        let title = page.text(TITLE).unwrap_or_default();
        let company = page
            .text(COMPANY)
            .or_else(|| page.attr(&["meta[property='og:site_name']"], "content"))
            .map(|c| c.trim_start_matches("at ").trim().to_string())
            .or_else(|| company_from_path(&page.url))
            .unwrap_or_default();
        let location = page.text(LOCATION).unwrap_or_default();
        let description = page.text(DESCRIPTION).unwrap_or_default();
        let metadata = page.texts(METADATA);

        JobPosting {
            salary_range: page.text(PAY).and_then(|p| parse::parse_salary(&p)),
            job_type: metadata.iter().find_map(|m| self.parse_job_type(m)),
            seniority: self.parse_seniority(&title),
            remote: self.is_remote(&location, &description),
            applicant_count: None,
            posted_date: None,
            skills: BTreeSet::new(),
            application_url: format!("{}#app", page.url.as_str().trim_end_matches("#app")),
            title,
            company,
            location,
            description,
            source_site: self.name().to_string(),
        }
    }

    fn extract_questions(&self, page: &Page) -> Vec<ScreeningQuestion> {
        page.select_all(QUESTION_FIELDS)
            .into_iter()
            .filter(|field| {
                !dom::select_within(*field, "input, select, textarea").iter().any(|c| {
                    c.value()
                        .attr("name")
                        .or_else(|| c.value().attr("id"))
                        .is_some_and(|n| {
                            let n = n.trim_end_matches(']');
                            CONTACT_FIELDS.iter().any(|f| n.ends_with(f))
                        })
                })
            })
            .enumerate()
            .filter_map(|(position, field)| {
                let label = dom::select_within(field, "label, legend")
                    .into_iter()
                    .map(dom::element_text)
                    .find(|t| !t.is_empty())?;
                question_from_controls(position, &label, field)
            })
            .collect()
    }
}

fn company_from_path(url: &Url) -> Option<String> {
    url.path_segments()?
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.replace('-', " "))
}
