mod autofill;
mod backend;
mod browser;
mod cache;
mod channel;
mod config;
mod detector;
mod dom;
mod error;
mod models;
mod orchestrator;
mod sanitize;

use anyhow::{anyhow, Context, Result};
use autofill::{AutofillEngine, FormDriver, MemoryForm};
use backend::HttpBackend;
use browser::BrowserSession;
use cache::AnswerCache;
use channel::Pipeline;
use clap::{Args, Parser, Subcommand};
use config::Config;
use detector::{Detector, Registry};
use dom::{DomSource, StaticPage};
use models::{JobPosting, Profile, QuestionType, ScreeningQuestion};
use orchestrator::{GenerateOptions, GenerationOutcome, Orchestrator, Progress};
use sanitize::sanitize_filename;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "hunt-apply")]
#[command(about = "Detect job postings, answer screening questions, and fill application forms")]
struct Cli {
    /// Path to config file (defaults to the per-user config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PageArgs {
    /// URL of the job page
    #[arg(long)]
    url: String,

    /// Read the page from a saved HTML file instead of a live browser
    #[arg(long)]
    html: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the job posting from a page
    Detect {
        #[command(flatten)]
        page: PageArgs,

        /// Also save the page HTML into this directory
        #[arg(long, value_name = "DIR")]
        save_html: Option<PathBuf>,
    },

    /// List the screening questions on an application form
    Questions {
        #[command(flatten)]
        page: PageArgs,
    },

    /// Generate answers for the screening questions
    Generate {
        #[command(flatten)]
        page: PageArgs,

        /// Applicant profile (JSON)
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Ask the backend even when a cached answer exists
        #[arg(long)]
        no_cache: bool,
    },

    /// Generate answers and write them into the form
    Fill {
        #[command(flatten)]
        page: PageArgs,

        /// Applicant profile (JSON)
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Ask the backend even when a cached answer exists
        #[arg(long)]
        no_cache: bool,

        /// Set values in one step instead of typing them
        #[arg(long)]
        no_typing: bool,

        /// Overwrite fields that already hold a value
        #[arg(long)]
        overwrite: bool,
    },

    /// Answer channel commands, one JSON object per line on stdin
    Serve {
        #[command(flatten)]
        page: PageArgs,

        /// Applicant profile (JSON)
        #[arg(short, long)]
        profile: Option<PathBuf>,
    },

    /// Manage cached answers
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached answers, newest first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Find cached answers similar to a question
    Lookup {
        question: String,

        /// Question type (text, boolean, select, numeric)
        #[arg(short = 't', long = "type", default_value = "text")]
        question_type: String,
    },

    /// Store an answer
    Save {
        question: String,

        answer: String,

        /// Question type (text, boolean, select, numeric)
        #[arg(short = 't', long = "type", default_value = "text")]
        question_type: String,

        /// Rating from 1 to 5
        #[arg(short, long)]
        rating: Option<u8>,
    },

    /// Rate a cached answer from 1 to 5
    Rate { id: i64, rating: u8 },
}

/// Where the page comes from and where writes go.
struct PageContext {
    source: Rc<dyn DomSource>,
    form: Rc<dyn FormDriver>,
    memory: Option<Rc<MemoryForm>>,
    browser: Option<Rc<BrowserSession>>,
}

impl PageContext {
    async fn open(args: &PageArgs, cfg: &Config) -> Result<Self> {
        if let Some(path) = &args.html {
            let html = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let memory = Rc::new(MemoryForm::parse(&html));
            return Ok(Self {
                source: Rc::new(StaticPage::new(&args.url, html)?),
                form: memory.clone(),
                memory: Some(memory),
                browser: None,
            });
        }

        let session = Rc::new(
            BrowserSession::connect(&cfg.browser.webdriver_url, cfg.browser.headless).await?,
        );
        session.open(&args.url).await?;
        Ok(Self {
            source: session.clone(),
            form: session.clone(),
            memory: None,
            browser: Some(session),
        })
    }

    async fn detector(&self, cfg: &Config) -> Result<Detector> {
        let registry = Registry::with_defaults();
        let url = self.source.current_url().await?;
        let unsupported = || {
            anyhow!(
                "Not a supported job page: {} (supported boards: {})",
                url,
                registry.names().join(", ")
            )
        };
        let board = registry.resolve(&url).ok_or_else(unsupported)?;
        let detector = Detector::new(board, Rc::clone(&self.source), cfg.detector.ttl());
        if !detector.is_job_board().await? {
            return Err(unsupported());
        }
        Ok(detector)
    }

    /// Write the current page HTML to `<dir>/<company>-<title>.html`.
    async fn save_html(&self, dir: &Path, posting: &JobPosting) -> Result<PathBuf> {
        let snapshot = self.source.snapshot().await?;
        let name = sanitize_filename(&format!("{}-{}.html", posting.company, posting.title));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(name);
        std::fs::write(&path, snapshot.html)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn questions(&self, cfg: &Config) -> Result<Vec<ScreeningQuestion>> {
        let questions = self.detector(cfg).await?.screening_questions().await?;
        if questions.is_empty() {
            return Err(anyhow!("No screening questions found on this page"));
        }
        Ok(questions)
    }

    async fn close(self) -> Result<()> {
        let PageContext { source, form, browser, .. } = self;
        drop(source);
        drop(form);
        if let Some(session) = browser.and_then(|b| Rc::try_unwrap(b).ok()) {
            session.quit().await?;
        }
        Ok(())
    }
}

fn init_logging(cfg: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { cfg.logging.filter.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output and channel replies
    let layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))
}

fn load_profile(path: Option<&Path>) -> Result<Profile> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match directories::ProjectDirs::from("", "", "hunt-apply") {
            Some(dirs) if dirs.config_dir().join("profile.json").exists() => {
                dirs.config_dir().join("profile.json")
            }
            _ => {
                warn!("No profile given; answers will not be personalised");
                return Ok(Profile::default());
            }
        },
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse profile {}", path.display()))
}

fn open_cache(cfg: &Config) -> Result<AnswerCache> {
    Ok(AnswerCache::open(&cfg.cache_path())?
        .with_similarity_floor(cfg.cache.similarity_floor)
        .with_max_results(cfg.cache.max_results))
}

fn open_backend(cfg: &Config) -> Result<HttpBackend> {
    let backend = HttpBackend::new(&cfg.backend.url, cfg.backend.timeout())?;
    Ok(backend.with_api_key(cfg.backend.api_key.clone()))
}

fn parse_question_type(raw: &str) -> Result<QuestionType> {
    QuestionType::parse(raw).ok_or_else(|| {
        anyhow!("Unknown question type '{}' (text, boolean, select, numeric)", raw)
    })
}

async fn generate(
    cfg: &Config,
    cache: &AnswerCache,
    backend: &HttpBackend,
    profile: &Profile,
    questions: &[ScreeningQuestion],
    use_cached: bool,
) -> Result<GenerationOutcome> {
    let mut run = Orchestrator::new(cache, backend, profile, questions.to_vec())?
        .with_max_tokens(cfg.backend.max_tokens);
    let outcome = run
        .generate_all(GenerateOptions { use_cached }, &mut |p| {
            println!("[{}/{}] {}", p.current, p.total, truncate(&p.question.text, 70));
        })
        .await?;
    Ok(outcome)
}

/// The serialized name of a unit enum variant, e.g. `Full-time`.
fn wire_name<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

fn print_posting(job: &JobPosting) {
    println!("{}", job.title);
    println!("Company: {}", job.company);
    if !job.location.is_empty() {
        println!("Location: {}{}", job.location, if job.remote { " (remote)" } else { "" });
    } else if job.remote {
        println!("Location: remote");
    }
    if let Some(pay) = &job.salary_range {
        println!("Pay: {} {:.0} - {:.0}", pay.currency, pay.min, pay.max);
    }
    if let Some(job_type) = &job.job_type {
        println!("Type: {}", wire_name(job_type));
    }
    if let Some(level) = &job.seniority {
        println!("Seniority: {}", wire_name(level));
    }
    if let Some(count) = job.applicant_count {
        println!("Applicants: {}", count);
    }
    if let Some(posted) = &job.posted_date {
        println!("Posted: {}", posted);
    }
    if !job.skills.is_empty() {
        println!("Skills: {}", job.skills.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    println!("Apply: {}", job.application_url);
    println!("Source: {}", job.source_site);
    if !job.description.is_empty() {
        println!("\n--- Description ---");
        println!("{}", textwrap::fill(&job.description, 80));
    }
}

fn print_outcome(questions: &[ScreeningQuestion], outcome: &GenerationOutcome) {
    for question in questions {
        println!("\n{} [{}]", question.text, question.question_type);
        match outcome.answers.iter().find(|a| a.question_id == question.id) {
            Some(answer) => {
                for line in textwrap::fill(&answer.answer, 76).lines() {
                    println!("  {}", line);
                }
                if answer.from_cache {
                    println!(
                        "  (cached #{}, similarity {:.2})",
                        answer.cache_id.unwrap_or_default(),
                        answer.similarity.unwrap_or_default()
                    );
                }
            }
            None => println!("  (no answer)"),
        }
    }

    for failure in &outcome.failures {
        println!("\nFailed {}: {}", failure.question_id, failure.reason);
    }

    let stats = &outcome.statistics;
    println!(
        "\n{} of {} answered ({} from cache), {} tokens",
        stats.generated, stats.total_questions, stats.from_cache, stats.total_tokens
    );
    if let Some(confidence) = stats.average_confidence {
        println!("Average confidence: {:.2}", confidence);
    }
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    match cli.command {
        Commands::Detect { page, save_html } => {
            let ctx = PageContext::open(&page, &cfg).await?;
            let mut detector = ctx.detector(&cfg).await?;
            let posting = detector.detect().await?;
            print_posting(&posting);
            if let Some(dir) = save_html {
                let path = ctx.save_html(&dir, &posting).await?;
                println!("\nSaved page to {}", path.display());
            }
            drop(detector);
            ctx.close().await?;
        }

        Commands::Questions { page } => {
            let ctx = PageContext::open(&page, &cfg).await?;
            let questions = ctx.questions(&cfg).await?;
            println!("{:<16} {:<8} {:<4} {:<50}", "ID", "TYPE", "REQ", "QUESTION");
            println!("{}", "-".repeat(80));
            for q in &questions {
                println!(
                    "{:<16} {:<8} {:<4} {:<50}",
                    q.id,
                    q.question_type,
                    if q.is_required { "*" } else { "" },
                    truncate(&q.text, 50)
                );
                if let Some(options) = &q.options {
                    println!("{:<30} options: {}", "", options.join(" | "));
                }
            }
            ctx.close().await?;
        }

        Commands::Generate { page, profile, no_cache } => {
            let profile = load_profile(profile.as_deref())?;
            let cache = open_cache(&cfg)?;
            let backend = open_backend(&cfg)?;
            let ctx = PageContext::open(&page, &cfg).await?;
            let questions = ctx.questions(&cfg).await?;
            let outcome = generate(&cfg, &cache, &backend, &profile, &questions, !no_cache).await?;
            print_outcome(&questions, &outcome);
            ctx.close().await?;
        }

        Commands::Fill { page, profile, no_cache, no_typing, overwrite } => {
            let profile = load_profile(profile.as_deref())?;
            let cache = open_cache(&cfg)?;
            let backend = open_backend(&cfg)?;
            let ctx = PageContext::open(&page, &cfg).await?;
            let questions = ctx.questions(&cfg).await?;
            let outcome = generate(&cfg, &cache, &backend, &profile, &questions, !no_cache).await?;
            print_outcome(&questions, &outcome);

            let mut options = cfg.fill_options();
            if no_typing {
                options.simulate_typing = false;
            }
            if overwrite {
                options.skip_filled = false;
            }
            let report = AutofillEngine::new(ctx.form.as_ref())
                .fill_answers(&questions, &outcome.answers, options)
                .await;

            println!("\nFilled {} field(s), skipped {}", report.filled_count, report.skipped.len());
            for failure in &report.failures {
                println!("  {}: {}", failure.question_id, failure.reason);
            }
            if let Some(memory) = &ctx.memory {
                println!("\nForm values:");
                for q in &questions {
                    let value = memory.value(&q.selector).unwrap_or_default();
                    println!("  {} = {:?}", q.selector, value);
                }
            }
            ctx.close().await?;
        }

        Commands::Serve { page, profile } => {
            let profile = load_profile(profile.as_deref())?;
            let cache = open_cache(&cfg)?;
            let backend = open_backend(&cfg)?;
            let ctx = PageContext::open(&page, &cfg).await?;
            let mut pipeline = Pipeline::new(
                Rc::clone(&ctx.source),
                Rc::clone(&ctx.form),
                cache,
                Box::new(backend),
                profile,
                cfg.clone(),
            )
            .with_progress(Box::new(|p: &Progress<'_>| {
                let event = json!({
                    "type": "PROGRESS",
                    "current": p.current,
                    "total": p.total,
                    "questionId": p.question.id,
                });
                println!("{}", event);
            }));

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = pipeline.handle_raw(&line).await;
                println!("{}", reply);
            }
            drop(pipeline);
            ctx.close().await?;
        }

        Commands::Cache { command } => {
            let cache = open_cache(&cfg)?;
            match command {
                CacheCommands::List { limit } => {
                    let entries = cache.list(limit)?;
                    if entries.is_empty() {
                        println!("No cached answers.");
                    } else {
                        println!(
                            "{:<6} {:<8} {:<6} {:<20} {:<40}",
                            "ID", "TYPE", "RATING", "CREATED", "QUESTION"
                        );
                        println!("{}", "-".repeat(84));
                        for entry in entries {
                            println!(
                                "{:<6} {:<8} {:<6} {:<20} {:<40}",
                                entry.id,
                                entry.question_type,
                                entry
                                    .rating
                                    .map(|r| r.to_string())
                                    .unwrap_or_else(|| "-".to_string()),
                                truncate(&entry.created_at, 19),
                                truncate(&entry.question_text, 40)
                            );
                            for line in textwrap::fill(&entry.answer_text, 70).lines() {
                                println!("{:<8}{}", "", line);
                            }
                        }
                        let location = cache
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        println!("\n{} answer(s) in {}", cache.len()?, location);
                    }
                }

                CacheCommands::Lookup { question, question_type } => {
                    let question_type = parse_question_type(&question_type)?;
                    let matches = cache.lookup(&question, question_type)?;
                    if matches.is_empty() {
                        println!(
                            "No cached answer above similarity {:.2}.",
                            cache.similarity_floor()
                        );
                    }
                    for m in matches {
                        let hit = &m.answer;
                        println!("#{} ({:.2}) {}", hit.id, m.similarity, hit.question_text);
                        for line in textwrap::fill(&m.answer.answer_text, 76).lines() {
                            println!("  {}", line);
                        }
                    }
                }

                CacheCommands::Save { question, answer, question_type, rating } => {
                    let question = ScreeningQuestion {
                        id: detector::parse::question_id(0, &question),
                        text: question,
                        question_type: parse_question_type(&question_type)?,
                        is_required: false,
                        max_length: None,
                        options: None,
                        selector: String::new(),
                    };
                    let saved = cache.save(&question, &answer, rating)?;
                    println!("Saved answer #{}", saved.id);
                }

                CacheCommands::Rate { id, rating } => {
                    if !cache.rate(id, rating)? {
                        println!("Answer #{} not found.", id);
                    } else if let Some(entry) = cache.get(id)? {
                        println!(
                            "Rated answer #{} {}/5: {}",
                            entry.id,
                            entry.rating.unwrap_or_default(),
                            truncate(&entry.question_text, 50)
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::resolve(cli.config.as_deref())?;
    init_logging(&cfg, cli.verbose)?;

    if let Err(err) = run(cli, cfg).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer question", 10), "a much ...");
        assert_eq!(truncate("résumé résumé", 8), "résum...");
    }

    #[test]
    fn test_cli_parses_fill_flags() {
        let cli = Cli::try_parse_from([
            "hunt-apply",
            "fill",
            "--url",
            "https://boards.greenhouse.io/acme/jobs/1",
            "--html",
            "page.html",
            "--no-typing",
        ])
        .unwrap();
        match cli.command {
            Commands::Fill { page, no_typing, overwrite, .. } => {
                assert_eq!(page.html, Some(PathBuf::from("page.html")));
                assert!(no_typing);
                assert!(!overwrite);
            }
            _ => panic!("expected fill"),
        }
    }

    #[tokio::test]
    async fn test_static_page_context_finds_questions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"<form id="application"><div class="field"><label for="q">Years of Rust?</label><input id="q" type="number"></div></form>"#,
        )
        .unwrap();
        let args = PageArgs {
            url: "https://boards.greenhouse.io/acme/jobs/1".to_string(),
            html: Some(file.path().to_path_buf()),
        };
        let cfg = Config::default();
        let ctx = PageContext::open(&args, &cfg).await.unwrap();
        let questions = ctx.questions(&cfg).await.unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].question_type, QuestionType::Numeric);
        assert!(ctx.memory.is_some());
        ctx.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_html_uses_safe_file_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"<h1 class="app-title">Rust / Infra</h1><span class="company-name">at ../Acme</span>"#,
        )
        .unwrap();
        let args = PageArgs {
            url: "https://boards.greenhouse.io/acme/jobs/1".to_string(),
            html: Some(file.path().to_path_buf()),
        };
        let cfg = Config::default();
        let ctx = PageContext::open(&args, &cfg).await.unwrap();
        let posting = ctx.detector(&cfg).await.unwrap().detect().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pages");
        let path = ctx.save_html(&out, &posting).await.unwrap();
        assert_eq!(path.parent(), Some(out.as_path()));
        assert_eq!(path.file_name().unwrap(), "Acme-Rust  Infra.html");
        assert!(std::fs::read_to_string(&path).unwrap().contains("app-title"));
    }

    #[tokio::test]
    async fn test_detector_rejects_non_job_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"<h1>Careers</h1>").unwrap();
        let args = PageArgs {
            url: "https://boards.greenhouse.io/acme".to_string(),
            html: Some(file.path().to_path_buf()),
        };
        let cfg = Config::default();
        let ctx = PageContext::open(&args, &cfg).await.unwrap();
        let err = ctx.detector(&cfg).await.err().unwrap();
        assert!(err.to_string().starts_with("Not a supported job page"));
    }
}
