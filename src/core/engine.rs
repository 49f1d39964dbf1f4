use crate::config::{FailurePolicy, IngestConfig};
use crate::core::output::OutputWriter;
use crate::domain::model::{FetchFailure, FetchOutcome, FetchRequest, Record, RunReport};
use crate::domain::ports::{Fetcher, Processor, Storage};
use crate::utils::error::{IngestError, Result};
use crate::utils::monitor::RunMonitor;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub name: String,
    pub concurrent_requests: usize,
    pub channel_capacity: usize,
    pub on_failure: FailurePolicy,
    pub max_failure_ratio: Option<f64>,
}

impl EngineSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            name: config.ingestion.name.clone(),
            concurrent_requests: config.fetch.concurrent_requests.max(1),
            channel_capacity: config.fetch.channel_capacity.max(1),
            on_failure: config.fetch.on_failure,
            max_failure_ratio: config.fetch.max_failure_ratio,
        }
    }
}

fn failure_from_error(request: FetchRequest, error: IngestError) -> FetchFailure {
    let attempts = error.attempts();
    let retryable = match &error {
        IngestError::RetryExhaustedError { .. } => true,
        other => other.is_retryable(),
    };
    FetchFailure {
        request,
        error: error.to_string(),
        attempts,
        retryable,
    }
}

/// Runs fetch, process and load as separate stages. The fetch stage lives in
/// its own task and only talks to processing through a bounded channel, so a
/// failing request never takes down its siblings or the processing side.
pub struct IngestionEngine<F: Fetcher, P: Processor, S: Storage> {
    fetcher: Arc<F>,
    processor: P,
    writer: OutputWriter<S>,
    settings: EngineSettings,
    monitor: RunMonitor,
}

impl<F, P, S> IngestionEngine<F, P, S>
where
    F: Fetcher + 'static,
    P: Processor,
    S: Storage,
{
    pub fn new(fetcher: F, processor: P, writer: OutputWriter<S>, settings: EngineSettings) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            processor,
            writer,
            settings,
            monitor: RunMonitor::new(false),
        }
    }

    pub fn new_with_monitoring(
        fetcher: F,
        processor: P,
        writer: OutputWriter<S>,
        settings: EngineSettings,
        monitor_enabled: bool,
    ) -> Self {
        let mut engine = Self::new(fetcher, processor, writer, settings);
        engine.monitor = RunMonitor::new(monitor_enabled);
        engine
    }

    pub fn monitor(&self) -> &RunMonitor {
        &self.monitor
    }

    fn spawn_fetch_stage(
        &self,
        requests: Vec<FetchRequest>,
    ) -> (JoinHandle<()>, mpsc::Receiver<FetchOutcome>) {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let fetcher = Arc::clone(&self.fetcher);
        let concurrency = self.settings.concurrent_requests;

        let handle = tokio::spawn(async move {
            let mut outcomes = stream::iter(requests)
                .map(|request| {
                    let fetcher = Arc::clone(&fetcher);
                    async move {
                        match fetcher.fetch(&request).await {
                            Ok(batch) => FetchOutcome::Fetched(batch),
                            Err(e) => FetchOutcome::Failed(failure_from_error(request, e)),
                        }
                    }
                })
                .buffer_unordered(concurrency);

            while let Some(outcome) = outcomes.next().await {
                if tx.send(outcome).await.is_err() {
                    tracing::debug!("Processing stage stopped listening; ending fetch stage");
                    break;
                }
            }
        });

        (handle, rx)
    }

    /// Drains the fetch stage. Returns the raw records, the failures and the
    /// number of successful batches.
    async fn collect(
        &self,
        requests: Vec<FetchRequest>,
    ) -> Result<(Vec<Record>, Vec<FetchFailure>, usize)> {
        let (handle, mut rx) = self.spawn_fetch_stage(requests);

        let mut records = Vec::new();
        let mut failures = Vec::new();
        let mut batches = 0;

        while let Some(outcome) = rx.recv().await {
            match outcome {
                FetchOutcome::Fetched(batch) => {
                    batches += 1;
                    tracing::debug!(
                        "Received {} records for {} (fetched at {})",
                        batch.records.len(),
                        batch.request.key,
                        batch.fetched_at
                    );
                    records.extend(batch.records);
                }
                FetchOutcome::Failed(failure) => {
                    tracing::warn!(
                        "⚠️ {} failed after {} attempt(s): {}",
                        failure.request.key,
                        failure.attempts,
                        failure.error
                    );
                    if self.settings.on_failure == FailurePolicy::Abort {
                        handle.abort();
                        return Err(IngestError::FetchStageError {
                            message: format!(
                                "aborting on failed request {}: {}",
                                failure.request.key, failure.error
                            ),
                        });
                    }
                    failures.push(failure);
                }
            }
        }

        if let Err(e) = handle.await {
            return Err(IngestError::FetchStageError {
                message: format!("fetch task ended abnormally after {} batches: {}", batches, e),
            });
        }

        Ok((records, failures, batches))
    }

    fn check_failure_budget(&self, requests: usize, failures: &[FetchFailure]) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        if failures.len() == requests {
            return Err(IngestError::FetchStageError {
                message: format!("all {} requests failed; first error: {}", requests, failures[0].error),
            });
        }
        if let Some(max_ratio) = self.settings.max_failure_ratio {
            let ratio = failures.len() as f64 / requests as f64;
            if ratio > max_ratio {
                return Err(IngestError::FetchStageError {
                    message: format!(
                        "{} of {} requests failed ({:.0}%), above the allowed {:.0}%",
                        failures.len(),
                        requests,
                        ratio * 100.0,
                        max_ratio * 100.0
                    ),
                });
            }
        }
        Ok(())
    }

    pub async fn run(&self, requests: Vec<FetchRequest>) -> Result<RunReport> {
        let started_at = Utc::now();
        let request_count = requests.len();
        if request_count == 0 {
            return Err(IngestError::ValidationError {
                message: "no requests to fetch".to_string(),
            });
        }

        self.monitor.start_run();
        tracing::info!(
            "🚀 Starting ingestion '{}' with {} requests ({} concurrent)",
            self.settings.name,
            request_count,
            self.settings.concurrent_requests
        );

        // Fetch
        let (records, failures, fetched_batches) = self.collect(requests).await?;
        self.monitor.end_phase("fetch");
        tracing::info!(
            "📥 Fetch stage complete: {} records from {} batches, {} failures",
            records.len(),
            fetched_batches,
            failures.len()
        );
        self.check_failure_budget(request_count, &failures)?;

        // Process
        let raw_records = records.len();
        let dataset = self.processor.process(records)?;
        self.monitor.end_phase("process");

        // Load
        let outputs = self.writer.write(&dataset, &failures).await?;
        self.monitor.end_phase("load");
        self.monitor.log_final_stats();

        Ok(RunReport {
            name: self.settings.name.clone(),
            requests: request_count,
            fetched_batches,
            failures,
            raw_records,
            output_rows: dataset.frame.len(),
            dropped_rows: dataset.dropped_rows,
            duplicate_rows: dataset.duplicate_rows,
            outputs,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::core::output::OutputSettings;
    use crate::core::processor::DataProcessor;
    use crate::core::retry::RetryPolicy;
    use crate::domain::model::{FetchBatch, ProcessedDataset};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Clone)]
    struct MockStorage {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl MockStorage {
        fn new() -> Self {
            Self {
                files: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        async fn get_file(&self, path: &str) -> Option<Vec<u8>> {
            self.files.lock().await.get(path).cloned()
        }
    }

    impl Storage for MockStorage {
        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            self.files.lock().await.get(path).cloned().ok_or_else(|| {
                IngestError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path),
                ))
            })
        }

        async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
            self.files
                .lock()
                .await
                .insert(path.to_string(), data.to_vec());
            Ok(())
        }
    }

    /// Serves canned bars per symbol; symbols listed in `failing` error out.
    struct MockFetcher {
        failing: Vec<String>,
        panic_on: Option<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockFetcher {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                panic_on: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let symbol = request.symbol.clone().unwrap_or_default();
            if self.panic_on.as_deref() == Some(symbol.as_str()) {
                panic!("fetcher blew up on {}", symbol);
            }
            if self.failing.contains(&symbol) {
                return Err(IngestError::RetryExhaustedError {
                    url: request.url.clone(),
                    attempts: 3,
                    last_error: "HTTP 503".to_string(),
                });
            }
            Ok(FetchBatch {
                request: request.clone(),
                records: vec![
                    Record::new()
                        .with("symbol", symbol.as_str())
                        .with("ts", "2024-01-02")
                        .with("close", 100.0),
                    Record::new()
                        .with("symbol", symbol.as_str())
                        .with("ts", "2024-01-03")
                        .with("close", 110.0),
                ],
                attempts: 1,
                fetched_at: Utc::now(),
            })
        }
    }

    fn requests(symbols: &[&str]) -> Vec<FetchRequest> {
        symbols
            .iter()
            .map(|s| FetchRequest {
                key: s.to_string(),
                url: format!("http://example.com/{}", s),
                symbol: Some(s.to_string()),
            })
            .collect()
    }

    fn settings(on_failure: FailurePolicy, max_failure_ratio: Option<f64>) -> EngineSettings {
        EngineSettings {
            name: "test".to_string(),
            concurrent_requests: 2,
            channel_capacity: 1,
            on_failure,
            max_failure_ratio,
        }
    }

    fn processor() -> DataProcessor {
        DataProcessor::new(ProcessingConfig {
            numeric_fields: vec!["close".to_string()],
            timestamp_field: Some("ts".to_string()),
            group_by: Some("symbol".to_string()),
            value_field: Some("close".to_string()),
            ..Default::default()
        })
    }

    fn writer(storage: MockStorage) -> OutputWriter<MockStorage> {
        OutputWriter::new(
            storage,
            OutputSettings {
                file_stem: "test".to_string(),
                formats: vec!["csv".to_string()],
                include_summary: true,
                compress: false,
                archive_name: None,
                display_root: "out".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_run_collects_all_batches() {
        let storage = MockStorage::new();
        let engine = IngestionEngine::new(
            MockFetcher::new(&[]),
            processor(),
            writer(storage.clone()),
            settings(FailurePolicy::Skip, None),
        );

        let report = engine.run(requests(&["AAPL", "MSFT", "NVDA"])).await.unwrap();

        assert_eq!(report.requests, 3);
        assert_eq!(report.fetched_batches, 3);
        assert_eq!(report.raw_records, 6);
        assert_eq!(report.output_rows, 6);
        assert!(report.failures.is_empty());
        assert_eq!(report.outputs, vec!["out/test.csv", "out/test_summary.json"]);

        let csv = String::from_utf8(storage.get_file("test.csv").await.unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "close,symbol,ts,close_pct_change");
        // Rows are regrouped by symbol regardless of completion order
        assert!(lines[1].contains("AAPL"));
        assert!(lines[6].contains("NVDA"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let storage = MockStorage::new();
        let engine = IngestionEngine::new(
            MockFetcher::new(&[]),
            processor(),
            writer(storage),
            settings(FailurePolicy::Skip, None),
        );

        engine
            .run(requests(&["A", "B", "C", "D", "E", "F"]))
            .await
            .unwrap();

        let max = engine.fetcher.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 2, "saw {} concurrent fetches", max);
        assert!(max >= 1);
    }

    #[tokio::test]
    async fn test_skip_policy_isolates_failures() {
        let storage = MockStorage::new();
        let engine = IngestionEngine::new(
            MockFetcher::new(&["MSFT"]),
            processor(),
            writer(storage.clone()),
            settings(FailurePolicy::Skip, None),
        );

        let report = engine.run(requests(&["AAPL", "MSFT", "NVDA"])).await.unwrap();

        assert_eq!(report.fetched_batches, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].request.key, "MSFT");
        assert_eq!(report.failures[0].attempts, 3);
        assert!(report.failures[0].retryable);
        assert_eq!(report.output_rows, 4);
        assert!((report.failure_ratio() - 1.0 / 3.0).abs() < 1e-9);
        assert!(storage.get_file("test_failures.json").await.is_some());
    }

    #[tokio::test]
    async fn test_failure_ratio_budget() {
        let engine = IngestionEngine::new(
            MockFetcher::new(&["MSFT", "NVDA"]),
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, Some(0.5)),
        );

        let result = engine.run(requests(&["AAPL", "MSFT", "NVDA"])).await;
        assert!(matches!(result, Err(IngestError::FetchStageError { .. })));
    }

    #[tokio::test]
    async fn test_all_failed_is_an_error() {
        let engine = IngestionEngine::new(
            MockFetcher::new(&["AAPL"]),
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
        );

        let result = engine.run(requests(&["AAPL"])).await;
        assert!(matches!(result, Err(IngestError::FetchStageError { .. })));
    }

    #[tokio::test]
    async fn test_abort_policy_stops_on_first_failure() {
        let storage = MockStorage::new();
        let engine = IngestionEngine::new(
            MockFetcher::new(&["MSFT"]),
            processor(),
            writer(storage.clone()),
            settings(FailurePolicy::Abort, None),
        );

        let result = engine.run(requests(&["AAPL", "MSFT", "NVDA"])).await;

        assert!(matches!(result, Err(IngestError::FetchStageError { .. })));
        assert!(storage.get_file("test.csv").await.is_none());
    }

    #[tokio::test]
    async fn test_panicking_fetch_stage_is_reported() {
        let mut fetcher = MockFetcher::new(&[]);
        fetcher.panic_on = Some("MSFT".to_string());
        let engine = IngestionEngine::new(
            fetcher,
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
        );

        let result = engine.run(requests(&["AAPL", "MSFT"])).await;
        assert!(matches!(result, Err(IngestError::FetchStageError { .. })));
    }

    #[tokio::test]
    async fn test_empty_request_list_is_rejected() {
        let engine = IngestionEngine::new(
            MockFetcher::new(&[]),
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
        );

        let result = engine.run(Vec::new()).await;
        assert!(matches!(result, Err(IngestError::ValidationError { .. })));
    }

    #[tokio::test]
    async fn test_monitor_records_phases() {
        let engine = IngestionEngine::new_with_monitoring(
            MockFetcher::new(&[]),
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
            false,
        );

        engine.run(requests(&["AAPL"])).await.unwrap();

        let phases: Vec<String> = engine.monitor().timings().into_iter().map(|t| t.phase).collect();
        assert_eq!(phases, vec!["fetch", "process", "load"]);
    }

    struct FailingProcessor;

    impl Processor for FailingProcessor {
        fn process(&self, _records: Vec<Record>) -> Result<ProcessedDataset> {
            Err(IngestError::ProcessingError {
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_processing_errors_propagate() {
        let engine = IngestionEngine::new(
            MockFetcher::new(&[]),
            FailingProcessor,
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
        );

        let result = engine.run(requests(&["AAPL"])).await;
        assert!(matches!(result, Err(IngestError::ProcessingError { .. })));
    }

    #[tokio::test]
    async fn test_monitor_times_each_run_from_its_start() {
        let engine = IngestionEngine::new_with_monitoring(
            MockFetcher::new(&[]),
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
            false,
        );

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        engine.run(requests(&["AAPL"])).await.unwrap();
        engine.run(requests(&["MSFT"])).await.unwrap();

        let timings = engine.monitor().timings();
        assert_eq!(timings.len(), 3);
        assert!(timings[0].elapsed < std::time::Duration::from_millis(300));
    }

    /// Answers 503 then 404 for `GONE` through a real retry policy and
    /// serves every other symbol from `MockFetcher`.
    struct FlakyThenMissingFetcher {
        retry: RetryPolicy,
        inner: MockFetcher,
    }

    #[async_trait::async_trait]
    impl Fetcher for FlakyThenMissingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch> {
            if request.key != "GONE" {
                return self.inner.fetch(request).await;
            }
            let (records, attempts) = self
                .retry
                .run(&request.url, |attempt| async move {
                    let status = if attempt == 1 { 503 } else { 404 };
                    Err::<Vec<Record>, _>(IngestError::HttpStatusError {
                        url: request.url.clone(),
                        status,
                        retry_after: None,
                        body: String::new(),
                        transient: status == 503,
                    })
                })
                .await?;
            Ok(FetchBatch {
                request: request.clone(),
                records,
                attempts,
                fetched_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_failure_reports_attempts_spent_before_fatal_error() {
        let engine = IngestionEngine::new(
            FlakyThenMissingFetcher {
                retry: RetryPolicy::new(
                    3,
                    std::time::Duration::from_millis(1),
                    std::time::Duration::from_millis(5),
                )
                .unwrap(),
                inner: MockFetcher::new(&[]),
            },
            processor(),
            writer(MockStorage::new()),
            settings(FailurePolicy::Skip, None),
        );

        let report = engine.run(requests(&["AAPL", "GONE"])).await.unwrap();

        assert_eq!(report.fetched_batches, 1);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.request.key, "GONE");
        assert_eq!(failure.attempts, 2);
        assert!(!failure.retryable);
        assert!(failure.error.contains("404"), "{}", failure.error);
    }
}
