use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autofill::FillOptions;
use crate::backend::API_KEY_ENV;
use crate::cache::DEFAULT_SIMILARITY_FLOOR;

pub const BACKEND_URL_ENV: &str = "HUNT_APPLY_BACKEND_URL";
pub const WEBDRIVER_URL_ENV: &str = "HUNT_APPLY_WEBDRIVER_URL";

const APP_NAME: &str = "hunt-apply";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub detector: Detector,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub autofill: Autofill,
    #[serde(default)]
    pub browser: Browser,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing TOML: {}", path.display()))?;
        Ok(cfg)
    }

    /// Explicit path if given, else the per-user config file when present,
    /// else defaults. Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = set(BACKEND_URL_ENV) {
            self.backend.url = url;
        }
        if let Some(key) = set(API_KEY_ENV) {
            self.backend.api_key = Some(key);
        }
        if let Some(url) = set(WEBDRIVER_URL_ENV) {
            self.browser.webdriver_url = url;
        }
    }

    /// Configured cache file, or `answers.db` in the per-user data directory.
    pub fn cache_path(&self) -> PathBuf {
        if let Some(path) = &self.cache.path {
            return path.clone();
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", APP_NAME) {
            dirs.data_dir().join("answers.db")
        } else {
            PathBuf::from("answers.db")
        }
    }

    pub fn fill_options(&self) -> FillOptions {
        FillOptions {
            skip_filled: self.autofill.skip_filled,
            simulate_typing: self.autofill.simulate_typing,
            delay_ms: self.autofill.delay_ms,
            jitter_ms: self.autofill.jitter_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backend {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}
impl Default for Backend {
    fn default() -> Self {
        Self {
            url: "http://localhost:8787/generate".into(),
            api_key: None,
            timeout_secs: 30,
            max_tokens: 512,
        }
    }
}
impl Backend {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Detector {
    pub ttl_ms: u64,
}
impl Default for Detector {
    fn default() -> Self {
        Self { ttl_ms: 5000 }
    }
}
impl Detector {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub path: Option<PathBuf>,
    pub similarity_floor: f64,
    pub max_results: usize,
}
impl Default for Cache {
    fn default() -> Self {
        Self {
            path: None,
            similarity_floor: DEFAULT_SIMILARITY_FLOOR,
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Autofill {
    pub simulate_typing: bool,
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub skip_filled: bool,
}
impl Default for Autofill {
    fn default() -> Self {
        Self {
            simulate_typing: true,
            delay_ms: 40,
            jitter_ms: 25,
            skip_filled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Browser {
    pub webdriver_url: String,
    pub headless: bool,
}
impl Default for Browser {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".into(),
            headless: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub filter: String,
    pub json: bool,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [backend]
            url = "https://answers.example.com/v1/generate"

            [autofill]
            delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend.url, "https://answers.example.com/v1/generate");
        assert_eq!(cfg.backend.timeout_secs, 30);
        assert_eq!(cfg.autofill.delay_ms, 10);
        assert!(cfg.autofill.simulate_typing);
        assert_eq!(cfg.detector.ttl(), Duration::from_millis(5000));
        assert_eq!(cfg.cache.similarity_floor, DEFAULT_SIMILARITY_FLOOR);
        assert_eq!(cfg.logging.filter, "info");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (BACKEND_URL_ENV, "http://10.0.0.2:9000/gen"),
            (API_KEY_ENV, "sk-test"),
            (WEBDRIVER_URL_ENV, "  "),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.backend.url, "http://10.0.0.2:9000/gen");
        assert_eq!(cfg.backend.api_key.as_deref(), Some("sk-test"));
        // blank values are ignored
        assert_eq!(cfg.browser.webdriver_url, "http://localhost:9515");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\npath = \"/tmp/answers-test.db\"\nsimilarity_floor = 0.9").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.cache_path(), PathBuf::from("/tmp/answers-test.db"));
        assert_eq!(cfg.cache.similarity_floor, 0.9);
        assert_eq!(cfg.cache.max_results, 5);

        assert!(Config::load(Path::new("/definitely/missing/config.toml")).is_err());
    }

    #[test]
    fn test_fill_options_follow_config() {
        let mut cfg = Config::default();
        cfg.autofill.skip_filled = false;
        let options = cfg.fill_options();
        assert!(!options.skip_filled);
        assert!(options.simulate_typing);
        assert_eq!(options.jitter_ms, 25);
    }
}
