use std::collections::BTreeSet;
use url::Url;

use super::{parse, question_from_controls, JobBoard};
use crate::dom::{self, Page};
use crate::models::{JobPosting, ScreeningQuestion};

const TITLE: &[&str] = &[
    "h1.jobsearch-JobInfoHeader-title",
    "[data-testid='jobsearch-JobInfoHeader-title']",
    "h2.jobsearch-JobInfoHeader-title",
];
const COMPANY: &[&str] = &[
    "[data-testid='inlineHeader-companyName']",
    "[data-company-name='true']",
    ".jobsearch-CompanyInfoContainer a",
];
const LOCATION: &[&str] = &[
    "[data-testid='inlineHeader-companyLocation']",
    "[data-testid='job-location']",
    ".jobsearch-JobInfoHeader-subtitle > div:last-child",
];
const SALARY: &[&str] = &[
    "#salaryInfoAndJobType .css-19j1a75",
    "#salaryInfoAndJobType span:first-child",
    "[data-testid='jobsearch-OtherJobDetailsContainer'] .salary",
];
const JOB_TYPE: &[&str] = &[
    "#salaryInfoAndJobType span:last-child",
    "[data-testid='jobsearch-JobMetadataHeader-item']",
];
const BENEFIT_CHIPS: &[&str] = &[
    "#jobDetailsSection .js-match-insights-provider-tvvxwd",
    "[data-testid='attribute_snippet_testid']",
];
const POSTED: &[&str] = &["[data-testid='myJobsStateDate']", ".jobsearch-JobMetadataFooter > span"];
const DESCRIPTION: &[&str] = &["#jobDescriptionText", ".jobsearch-jobDescriptionText"];
const APPLY: &[&str] = &[
    "#applyButtonLinkContainer a",
    "a#indeedApplyButton",
    "a[data-testid='apply-button']",
];

/// Indeed Apply question-module items.
const QUESTION_ITEMS: &str = ".ia-Questions-item, [data-testid^='input-q_']";

pub struct Indeed;

impl JobBoard for Indeed {
    fn name(&self) -> &'static str {
        "indeed"
    }

    fn hosts(&self) -> &'static [&'static str] {
        &["indeed.com"]
    }

    fn is_job_path(&self, url: &Url) -> bool {
        let path = url.path();
        if url.host_str().is_some_and(|h| h.starts_with("smartapply.")) {
            return path.contains("/indeedapply/form");
        }
        if path.starts_with("/viewjob") || path.starts_with("/m/viewjob") {
            return true;
        }
        path.starts_with("/jobs")
            && url.query_pairs().any(|(k, v)| (k == "vjk" || k == "jk") && !v.is_empty())
    }

    fn extract_job_data(&self, page: &Page) -> JobPosting {
        let title = page
            .text(TITLE)
            .map(|t| t.trim_end_matches("- job post").trim().to_string())
            .unwrap_or_default();
        let company = page.text(COMPANY).unwrap_or_default();
        let location = page.text(LOCATION).unwrap_or_default();
        let description = page.text(DESCRIPTION).unwrap_or_default();
        let chips = page.texts(BENEFIT_CHIPS);

        let job_type = page
            .texts(JOB_TYPE)
            .iter()
            .chain(chips.iter())
            .find_map(|t| self.parse_job_type(t));

        let application_url = page
            .attr(APPLY, "href")
            .and_then(|href| page.absolute(&href))
            .unwrap_or_else(|| page.url.to_string());

        JobPosting {
            salary_range: page.text(SALARY).and_then(|s| parse::parse_salary(&s)),
            seniority: self.parse_seniority(&title),
            remote: self.is_remote(&location, &description),
            // Indeed shows no applicant count or skill list on the job page.
            applicant_count: None,
            skills: chips
                .into_iter()
                .filter(|c| self.parse_job_type(c).is_none())
                .collect::<BTreeSet<_>>(),
            posted_date: page.text(POSTED),
            title,
            company,
            location,
            job_type,
            description,
            application_url,
            source_site: self.name().to_string(),
        }
    }

    fn extract_questions(&self, page: &Page) -> Vec<ScreeningQuestion> {
        page.select_all(QUESTION_ITEMS)
            .into_iter()
            .enumerate()
            .filter_map(|(position, item)| {
                let label = dom::select_within(item, "label, legend, [data-testid$='-label']")
                    .into_iter()
                    .map(dom::element_text)
                    .find(|t| !t.is_empty())?;
                let label = label.trim_end_matches("(optional)").trim().to_string();
                question_from_controls(position, &label, item)
            })
            .collect()
    }
}
