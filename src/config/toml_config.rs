use crate::utils::error::{IngestError, Result};
use crate::utils::validation::{self, Validate};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub ingestion: IngestionConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// May contain a `{symbol}` placeholder, expanded once per symbol.
    pub endpoint: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    pub method: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub parameters: Option<HashMap<String, String>>,
    /// Dotted path to the records inside the response body, e.g. `data.bars`.
    pub records_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Skip,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub concurrent_requests: usize,
    pub channel_capacity: usize,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Only consulted with `on_failure = "skip"`.
    pub max_failure_ratio: Option<f64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrent_requests: 4,
            channel_capacity: 64,
            on_failure: FailurePolicy::Skip,
            max_failure_ratio: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub field_mapping: Option<BTreeMap<String, String>>,
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub numeric_fields: Vec<String>,
    pub timestamp_field: Option<String>,
    pub group_by: Option<String>,
    #[serde(default)]
    pub dedupe_on: Vec<String>,
    pub value_field: Option<String>,
    pub rolling_window: Option<usize>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub lookback_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: String,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    pub file_stem: Option<String>,
    #[serde(default = "default_true")]
    pub include_summary: bool,
    pub compression: Option<CompressionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub json_logs: Option<bool>,
}

fn default_formats() -> Vec<String> {
    vec!["csv".to_string()]
}

fn default_true() -> bool {
    true
}

const VALID_FORMATS: [&str; 2] = ["csv", "json"];
const VALID_METHODS: [&str; 2] = ["GET", "POST"];

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

impl IngestConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(IngestError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| IngestError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replaces `${VAR}` with the environment value; unset variables stay verbatim.
    fn substitute_env_vars(content: &str) -> String {
        env_var_pattern()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .into_owned()
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string("ingestion.name", &self.ingestion.name)?;
        validation::validate_url("source.endpoint", &self.source.endpoint)?;

        if self.source.endpoint.contains("{symbol}") && self.source.symbols.is_empty() {
            return Err(IngestError::ConfigValidationError {
                field: "source.symbols".to_string(),
                message: "endpoint contains {symbol} but no symbols are configured".to_string(),
            });
        }
        for symbol in &self.source.symbols {
            validation::validate_non_empty_string("source.symbols", symbol)?;
        }
        if let Some(method) = &self.source.method {
            validation::validate_one_of("source.method", &method.to_uppercase(), &VALID_METHODS)?;
        }
        if let Some(timeout) = self.source.timeout_seconds {
            validation::validate_positive_number("source.timeout_seconds", timeout as usize, 1)?;
        }

        if self.rate_limit.requests_per_second.is_some()
            && self.rate_limit.requests_per_minute.is_some()
        {
            return Err(IngestError::ConfigValidationError {
                field: "rate_limit".to_string(),
                message: "set either requests_per_second or requests_per_minute, not both"
                    .to_string(),
            });
        }
        for (field, value) in [
            ("rate_limit.requests_per_second", self.rate_limit.requests_per_second),
            ("rate_limit.requests_per_minute", self.rate_limit.requests_per_minute),
            ("rate_limit.burst", self.rate_limit.burst),
        ] {
            if let Some(value) = value {
                validation::validate_positive_number(field, value as usize, 1)?;
            }
        }

        validation::validate_positive_number(
            "retry.max_attempts",
            self.retry.max_attempts as usize,
            1,
        )?;
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(IngestError::InvalidConfigValueError {
                field: "retry.base_delay_ms".to_string(),
                value: self.retry.base_delay_ms.to_string(),
                reason: format!("must not exceed retry.max_delay_ms ({})", self.retry.max_delay_ms),
            });
        }

        validation::validate_positive_number(
            "fetch.concurrent_requests",
            self.fetch.concurrent_requests,
            1,
        )?;
        validation::validate_positive_number("fetch.channel_capacity", self.fetch.channel_capacity, 1)?;
        if let Some(ratio) = self.fetch.max_failure_ratio {
            validation::validate_range("fetch.max_failure_ratio", ratio, 0.0, 1.0)?;
        }

        if let Some(window) = self.processing.rolling_window {
            validation::validate_positive_number("processing.rolling_window", window, 1)?;
        }
        if let (Some(start), Some(end)) = (self.processing.start_date, self.processing.end_date) {
            if start > end {
                return Err(IngestError::InvalidConfigValueError {
                    field: "processing.start_date".to_string(),
                    value: start.to_string(),
                    reason: format!("must not be after processing.end_date ({})", end),
                });
            }
        }
        if let Some(days) = self.processing.lookback_days {
            validation::validate_positive_number("processing.lookback_days", days.max(0) as usize, 1)?;
        }
        if self.processing.has_date_window() && self.processing.timestamp_field.is_none() {
            return Err(IngestError::MissingConfigError {
                field: "processing.timestamp_field".to_string(),
            });
        }

        validation::validate_path("output.path", &self.output.path)?;
        if self.output.formats.is_empty() {
            return Err(IngestError::MissingConfigError {
                field: "output.formats".to_string(),
            });
        }
        for format in &self.output.formats {
            validation::validate_one_of("output.formats", format, &VALID_FORMATS)?;
        }

        Ok(())
    }

    pub fn output_path(&self) -> &str {
        &self.output.path
    }

    /// File name stem for outputs, defaulting to the ingestion name.
    pub fn file_stem(&self) -> &str {
        self.output
            .file_stem
            .as_deref()
            .unwrap_or(&self.ingestion.name)
    }

    pub fn compression_enabled(&self) -> bool {
        self.output
            .compression
            .as_ref()
            .map(|c| c.enabled)
            .unwrap_or(false)
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn json_logs(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.json_logs)
            .unwrap_or(false)
    }
}

impl ProcessingConfig {
    pub fn has_date_window(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some() || self.lookback_days.is_some()
    }
}

impl Validate for IngestConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
