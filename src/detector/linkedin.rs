use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use url::Url;

use super::{question_from_controls, JobBoard};
use crate::dom::{self, Page};
use crate::models::{JobPosting, ScreeningQuestion};

static JOB_VIEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/jobs/view/\d+").expect("static regex"));

const TITLE: &[&str] = &[
    ".job-details-jobs-unified-top-card__job-title h1",
    ".job-details-jobs-unified-top-card__job-title",
    ".jobs-unified-top-card__job-title",
    ".top-card-layout__title",
];
const COMPANY: &[&str] = &[
    ".job-details-jobs-unified-top-card__company-name a",
    ".job-details-jobs-unified-top-card__company-name",
    ".jobs-unified-top-card__company-name",
    ".topcard__org-name-link",
];
const LOCATION: &[&str] = &[
    ".job-details-jobs-unified-top-card__primary-description-container .tvm__text:first-child",
    ".jobs-unified-top-card__bullet",
    ".topcard__flavor--bullet",
];
const SALARY: &[&str] = &[
    ".job-details-jobs-unified-top-card__job-insight--highlight",
    "#SALARY .salary",
    ".salary.compensation__salary",
];
const INSIGHTS: &[&str] = &[
    ".job-details-preferences-and-skills__pill",
    ".job-details-jobs-unified-top-card__job-insight span",
    ".description__job-criteria-text",
];
const APPLICANTS: &[&str] = &[
    ".jobs-unified-top-card__applicant-count",
    ".num-applicants__caption",
    ".job-details-jobs-unified-top-card__applicant-count",
];
const POSTED: &[&str] = &[
    ".jobs-unified-top-card__posted-date",
    ".posted-time-ago__text",
    ".job-details-jobs-unified-top-card__posted-date",
];
const SKILLS: &[&str] = &[
    ".job-details-skill-match-status-list li",
    ".job-details-how-you-match__skills-item-subtitle",
];
// Same fallback chain the description fetcher walks.
const DESCRIPTION: &[&str] = &[
    ".jobs-description__content",
    ".jobs-box__html-content",
    ".show-more-less-html__markup",
    ".description__text",
    "#job-details",
];
const APPLY: &[&str] = &[".jobs-apply-button--top-card a", "a.jobs-apply-button"];

/// Easy Apply modal form groups.
const QUESTION_GROUPS: &str =
    ".jobs-easy-apply-form-section__grouping, .jobs-easy-apply-form-element";

pub struct LinkedIn;

impl JobBoard for LinkedIn {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    fn hosts(&self) -> &'static [&'static str] {
        &["linkedin.com"]
    }

    fn is_job_path(&self, url: &Url) -> bool {
        let path = url.path();
        if JOB_VIEW_RE.is_match(path) {
            return true;
        }
        (path.starts_with("/jobs/search") || path.starts_with("/jobs/collections"))
            && url.query_pairs().any(|(k, v)| k == "currentJobId" && !v.is_empty())
    }

    fn extract_job_data(&self, page: &Page) -> JobPosting {
        let title = page.text(TITLE).unwrap_or_default();
        let company = page.text(COMPANY).unwrap_or_default();
        let location = page.text(LOCATION).unwrap_or_default();
        let description = page.text(DESCRIPTION).unwrap_or_default();
        let insights = page.texts(INSIGHTS);

        let job_type = insights.iter().find_map(|chip| self.parse_job_type(chip));
        let seniority = insights
            .iter()
            .find_map(|chip| self.parse_seniority(chip))
            .or_else(|| self.parse_seniority(&title));
        let remote = self.is_remote(&location, &description)
            || insights.iter().any(|chip| self.is_remote(chip, ""));

        let application_url = page
            .attr(APPLY, "href")
            .and_then(|href| page.absolute(&href))
            .unwrap_or_else(|| page.url.to_string());

        JobPosting {
            salary_range: page.text(SALARY).and_then(|s| super::parse::parse_salary(&s)),
            applicant_count: page
                .text(APPLICANTS)
                .and_then(|t| self.parse_applicant_count(&t)),
            posted_date: page.text(POSTED),
            skills: page.texts(SKILLS).into_iter().collect::<BTreeSet<_>>(),
            title,
            company,
            location,
            job_type,
            seniority,
            remote,
            description,
            application_url,
            source_site: self.name().to_string(),
        }
    }

    fn extract_questions(&self, page: &Page) -> Vec<ScreeningQuestion> {
        page.select_all(QUESTION_GROUPS)
            .into_iter()
            .enumerate()
            .filter_map(|(position, group)| {
                let label = dom::select_within(group, "label, legend")
                    .into_iter()
                    .map(dom::element_text)
                    .find(|t| !t.is_empty())?;
                question_from_controls(position, &label, group)
            })
            .collect()
    }
}
