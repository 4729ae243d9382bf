//! Configuration for lectern, read from `.lectern/lectern.toml`.
//!
//! Layered: file → environment → CLI. Every field has a default, so an empty
//! or missing file is a valid configuration.
//!
//! ```toml
//! [pipeline]
//! lease_timeout_secs = 300
//! max_plans = 6
//! generation_concurrency = 8
//! storage_concurrency = 8
//! segment_length_secs = 600
//!
//! [context]
//! trailing_window_secs = 120
//! recent_question_count = 3
//!
//! [providers]
//! analysis_url = "http://localhost:8700/analyze"
//! request_timeout_secs = 60
//!
//! [providers.generator_urls]
//! multiple_choice = "http://localhost:8701/generate"
//! hotspot = "http://localhost:8702/generate"
//!
//! [logging]
//! level = "info"
//! json = false
//! file = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::archetype::Archetype;
use crate::context::ContextPropagator;
use crate::pipeline::PipelineSettings;

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".lectern";

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "lectern.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Seconds before a segment lease may be taken over.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    /// Upper bound on plans kept per segment.
    #[serde(default = "default_max_plans")]
    pub max_plans: usize,
    #[serde(default = "default_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub storage_concurrency: usize,
    /// Segment length used when ingesting a course.
    #[serde(default = "default_segment_length_secs")]
    pub segment_length_secs: f64,
}

fn default_lease_timeout_secs() -> u64 {
    300
}

fn default_max_plans() -> usize {
    6
}

fn default_concurrency() -> usize {
    8
}

fn default_segment_length_secs() -> f64 {
    600.0
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            lease_timeout_secs: default_lease_timeout_secs(),
            max_plans: default_max_plans(),
            generation_concurrency: default_concurrency(),
            storage_concurrency: default_concurrency(),
            segment_length_secs: default_segment_length_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_trailing_window_secs")]
    pub trailing_window_secs: f64,
    #[serde(default = "default_recent_question_count")]
    pub recent_question_count: usize,
}

fn default_trailing_window_secs() -> f64 {
    crate::context::DEFAULT_TRAILING_WINDOW_SECS
}

fn default_recent_question_count() -> usize {
    crate::context::DEFAULT_RECENT_QUESTIONS
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            trailing_window_secs: default_trailing_window_secs(),
            recent_question_count: default_recent_question_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersSection {
    /// Content-analysis endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_url: Option<String>,
    /// Generator endpoint per archetype name.
    #[serde(default)]
    pub generator_urls: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            analysis_url: None,
            generator_urls: BTreeMap::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Fallback filter when neither `RUST_LOG` nor `LECTERN_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rotated log file under `.lectern/logs`.
    #[serde(default)]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: false,
        }
    }
}

/// The complete lectern.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LecternToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl LecternToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse lectern.toml")
    }

    /// Load `lectern.toml` from the data directory, or defaults if absent.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize lectern.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `LECTERN_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("LECTERN_ANALYSIS_URL")
            && !url.trim().is_empty()
        {
            self.providers.analysis_url = Some(url);
        }
        if let Ok(secs) = std::env::var("LECTERN_LEASE_TIMEOUT_SECS") {
            self.pipeline.lease_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid LECTERN_LEASE_TIMEOUT_SECS '{}'", secs))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.lease_timeout_secs == 0 {
            warnings.push("lease_timeout_secs is 0: every lease is immediately expired".to_string());
        }
        if self.pipeline.max_plans == 0 {
            warnings.push("max_plans is 0: segments will produce no questions".to_string());
        }
        if self.pipeline.generation_concurrency == 0 {
            warnings.push("generation_concurrency must be at least 1".to_string());
        }
        if self.pipeline.storage_concurrency == 0 {
            warnings.push("storage_concurrency must be at least 1".to_string());
        }
        let segment_length = self.pipeline.segment_length_secs;
        if segment_length.is_nan() || segment_length <= 0.0 {
            warnings.push(format!(
                "segment_length_secs must be positive, got {}",
                segment_length
            ));
        }
        if self.context.trailing_window_secs < 0.0 {
            warnings.push("trailing_window_secs must not be negative".to_string());
        }
        if self.providers.analysis_url.is_none() {
            warnings.push("providers.analysis_url is not set".to_string());
        }
        for name in self.providers.generator_urls.keys() {
            if name.parse::<Archetype>().is_err() {
                warnings.push(format!("Unknown archetype '{}' in providers.generator_urls", name));
            }
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }

    /// Generator endpoints keyed by parsed archetype. Unknown names are skipped.
    pub fn generator_endpoints(&self) -> BTreeMap<Archetype, String> {
        self.providers
            .generator_urls
            .iter()
            .filter_map(|(name, url)| name.parse::<Archetype>().ok().map(|a| (a, url.clone())))
            .collect()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            lease_timeout: Duration::from_secs(self.pipeline.lease_timeout_secs),
            max_plans: self.pipeline.max_plans,
            generation_concurrency: self.pipeline.generation_concurrency.max(1),
            storage_concurrency: self.pipeline.storage_concurrency.max(1),
        }
    }

    pub fn context_propagator(&self) -> ContextPropagator {
        ContextPropagator::new(
            self.context.trailing_window_secs,
            self.context.recent_question_count,
        )
    }
}

/// Runtime configuration: lectern.toml plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct LecternConfig {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub toml: LecternToml,
    /// CLI override: debug-level logging.
    pub verbose: bool,
    /// CLI override: JSON log output.
    pub cli_json_logs: Option<bool>,
}

impl LecternConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let data_dir = project_dir.join(DATA_DIR);
        let mut toml = LecternToml::load_or_default(&data_dir)?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            data_dir,
            toml,
            verbose: false,
            cli_json_logs: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, json_logs: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_json_logs = json_logs.then_some(true);
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("lectern.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir.is_dir()
    }

    /// JSON logs: CLI → file → default.
    pub fn json_logs(&self) -> bool {
        self.cli_json_logs.unwrap_or(self.toml.logging.json)
    }

    /// Fallback log filter when no env filter is set.
    pub fn log_level(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.toml.logging.level.clone()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = LecternToml::parse("").unwrap();
        assert_eq!(toml.pipeline.lease_timeout_secs, 300);
        assert_eq!(toml.pipeline.max_plans, 6);
        assert_eq!(toml.pipeline.generation_concurrency, 8);
        assert_eq!(toml.pipeline.storage_concurrency, 8);
        assert_eq!(toml.pipeline.segment_length_secs, 600.0);
        assert_eq!(toml.context.trailing_window_secs, 120.0);
        assert_eq!(toml.context.recent_question_count, 3);
        assert_eq!(toml.logging.level, "info");
    }

    #[test]
    fn test_parse_generator_urls() {
        let content = r#"
[providers]
analysis_url = "http://analysis.local/run"

[providers.generator_urls]
mcq = "http://gen.local/mcq"
essay = "http://gen.local/essay"
"#;
        let toml = LecternToml::parse(content).unwrap();
        let endpoints = toml.generator_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(
            endpoints.get(&Archetype::MultipleChoice).map(String::as_str),
            Some("http://gen.local/mcq")
        );

        let warnings = toml.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Unknown archetype 'essay'"));
    }

    #[test]
    fn test_validate_flags_zero_values() {
        let content = r#"
[pipeline]
lease_timeout_secs = 0
generation_concurrency = 0
segment_length_secs = -5.0
"#;
        let toml = LecternToml::parse(content).unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("lease_timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("generation_concurrency")));
        assert!(warnings.iter().any(|w| w.contains("segment_length_secs")));
        assert_eq!(toml.pipeline_settings().generation_concurrency, 1);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved_url = std::env::var("LECTERN_ANALYSIS_URL").ok();
        let saved_ttl = std::env::var("LECTERN_LEASE_TIMEOUT_SECS").ok();

        unsafe {
            std::env::set_var("LECTERN_ANALYSIS_URL", "http://env.local/analyze");
            std::env::set_var("LECTERN_LEASE_TIMEOUT_SECS", "45");
        }
        let mut toml = LecternToml::parse("[pipeline]\nlease_timeout_secs = 900\n").unwrap();
        toml.apply_env().unwrap();
        assert_eq!(toml.pipeline.lease_timeout_secs, 45);
        assert_eq!(
            toml.providers.analysis_url.as_deref(),
            Some("http://env.local/analyze")
        );

        unsafe { std::env::set_var("LECTERN_LEASE_TIMEOUT_SECS", "soon") };
        assert!(toml.apply_env().is_err());

        unsafe {
            match saved_url {
                Some(v) => std::env::set_var("LECTERN_ANALYSIS_URL", v),
                None => std::env::remove_var("LECTERN_ANALYSIS_URL"),
            }
            match saved_ttl {
                Some(v) => std::env::set_var("LECTERN_LEASE_TIMEOUT_SECS", v),
                None => std::env::remove_var("LECTERN_LEASE_TIMEOUT_SECS"),
            }
        }
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut toml = LecternToml::default();
        toml.pipeline.max_plans = 4;
        toml.providers
            .generator_urls
            .insert("hotspot".into(), "http://gen.local/hotspot".into());
        toml.save(&path).unwrap();

        let loaded = LecternToml::load(&path).unwrap();
        assert_eq!(loaded.pipeline.max_plans, 4);
        assert_eq!(loaded.generator_endpoints().len(), 1);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = LecternToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.pipeline.max_plans, 6);
    }

    #[test]
    fn test_config_paths_and_cli_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(DATA_DIR)).unwrap();
        std::fs::write(
            dir.path().join(DATA_DIR).join(CONFIG_FILE),
            "[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let config = LecternConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.db_path().ends_with(".lectern/lectern.db"));
        assert!(config.log_dir().ends_with(".lectern/logs"));
        assert!(config.config_file().ends_with(".lectern/lectern.toml"));
        assert_eq!(config.log_level(), "warn");
        assert!(!config.json_logs());

        let config = LecternConfig::with_cli_args(dir.path().to_path_buf(), true, true).unwrap();
        assert_eq!(config.log_level(), "debug");
        assert!(config.json_logs());
    }
}
