use reqwest_retry::Retryable;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest_middleware::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatusError {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
        body: String,
        /// Classified by reqwest-retry's default strategy.
        transient: bool,
    },

    #[error("Giving up on {url} after {attempts} attempts: {last_error}")]
    RetryExhaustedError {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Request to {url} failed permanently on attempt {attempts}: {source}")]
    RetryAbortedError {
        url: String,
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Fetch stage failed: {message}")]
    FetchStageError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration error in '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Configuration,
    Processing,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Medium,
    High,
    Critical,
}

impl IngestError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::RetryAbortedError { source, .. } => source.category(),
            IngestError::ApiError(_)
            | IngestError::ClientError(_)
            | IngestError::HttpStatusError { .. }
            | IngestError::RetryExhaustedError { .. }
            | IngestError::FetchStageError { .. } => ErrorCategory::Network,
            IngestError::ConfigError { .. }
            | IngestError::ConfigValidationError { .. }
            | IngestError::InvalidConfigValueError { .. }
            | IngestError::MissingConfigError { .. } => ErrorCategory::Configuration,
            IngestError::CsvError(_)
            | IngestError::SerializationError(_)
            | IngestError::ProcessingError { .. }
            | IngestError::ValidationError { .. } => ErrorCategory::Processing,
            IngestError::ZipError(_) | IngestError::IoError(_) => ErrorCategory::Storage,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::Processing => ErrorSeverity::High,
            ErrorCategory::Configuration | ErrorCategory::Storage => ErrorSeverity::Critical,
        }
    }

    /// Whether another attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::ApiError(e) => e.is_timeout() || e.is_connect(),
            IngestError::ClientError(e) => {
                reqwest_retry::default_on_request_failure(e) == Some(Retryable::Transient)
            }
            IngestError::HttpStatusError { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Attempts spent on the request that produced this error.
    pub fn attempts(&self) -> u32 {
        match self {
            IngestError::RetryExhaustedError { attempts, .. }
            | IngestError::RetryAbortedError { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Server supplied wait hint, only present on throttling responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            IngestError::HttpStatusError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            IngestError::RetryAbortedError { source, .. } => source.recovery_suggestion(),
            IngestError::HttpStatusError { status: 429, .. } => {
                "Lower rate_limit.requests_per_second or increase retry.base_delay_ms"
            }
            IngestError::HttpStatusError { status, .. } if *status == 401 || *status == 403 => {
                "Check the API credentials configured in source.headers or source.parameters"
            }
            IngestError::HttpStatusError { status: 404, .. } => {
                "Check source.endpoint and the configured symbols"
            }
            IngestError::ApiError(_)
            | IngestError::ClientError(_)
            | IngestError::HttpStatusError { .. }
            | IngestError::RetryExhaustedError { .. } => {
                "Check network connectivity and the API status, then run again"
            }
            IngestError::FetchStageError { .. } => {
                "Inspect the failure report and consider fetch.on_failure = \"skip\""
            }
            IngestError::ConfigError { .. }
            | IngestError::ConfigValidationError { .. }
            | IngestError::InvalidConfigValueError { .. }
            | IngestError::MissingConfigError { .. } => "Fix the configuration file and run again",
            IngestError::CsvError(_)
            | IngestError::SerializationError(_)
            | IngestError::ProcessingError { .. }
            | IngestError::ValidationError { .. } => {
                "Check source.records_path and the processing field settings against the API response"
            }
            IngestError::ZipError(_) | IngestError::IoError(_) => {
                "Check that output.path exists and is writable"
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Network => format!("Could not fetch market data: {}", self),
            ErrorCategory::Configuration => format!("Invalid configuration: {}", self),
            ErrorCategory::Processing => format!("Could not process fetched data: {}", self),
            ErrorCategory::Storage => format!("Could not write output: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
