use clap::Parser;
use market_ingest::utils::error::ErrorSeverity;
use market_ingest::utils::{logger, validation::Validate};
use market_ingest::{
    build_requests, CliArgs, DataProcessor, EngineSettings, HttpFetcher, IngestConfig,
    IngestError, IngestionEngine, LocalStorage, OutputSettings, OutputWriter,
};

fn exit_code(e: &IngestError) -> i32 {
    match e.severity() {
        ErrorSeverity::Medium => 2,
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    }
}

fn fail(context: &str, e: &IngestError) -> ! {
    tracing::error!(
        "❌ {}: {} (Category: {:?}, Severity: {:?})",
        context,
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 {}", e.recovery_suggestion());
    std::process::exit(exit_code(e));
}

fn display_config_summary(config: &IngestConfig) {
    tracing::info!("📋 Ingestion: {}", config.ingestion.name);
    if let Some(description) = &config.ingestion.description {
        tracing::info!("   {}", description);
    }
    tracing::info!("🌐 Endpoint: {}", config.source.endpoint);
    if !config.source.symbols.is_empty() {
        tracing::info!("📈 Symbols: {}", config.source.symbols.join(", "));
    }
    match (
        config.rate_limit.requests_per_second,
        config.rate_limit.requests_per_minute,
    ) {
        (Some(rps), _) => tracing::info!("⏱️ Rate limit: {} req/s", rps),
        (_, Some(rpm)) => tracing::info!("⏱️ Rate limit: {} req/min", rpm),
        _ => tracing::info!("⏱️ Rate limit: none"),
    }
    tracing::info!(
        "🔁 Retry: {} attempts, {}ms base delay",
        config.retry.max_attempts,
        config.retry.base_delay_ms
    );
    tracing::info!(
        "📦 Output: {} ({})",
        config.output_path(),
        config.output.formats.join(", ")
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = match IngestConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 初始化日誌
    if args.json_logs || config.json_logs() {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🚀 Starting market-ingest");
    tracing::info!("📁 Loaded configuration from: {}", args.config);

    args.apply_overrides(&mut config);

    if let Err(e) = config.validate() {
        fail("Configuration validation failed", &e);
    }
    display_config_summary(&config);

    let requests = match build_requests(&config.source) {
        Ok(requests) => requests,
        Err(e) => fail("Could not build requests", &e),
    };

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - No requests will be sent");
        for request in &requests {
            println!("{}\t{}", request.key, request.url);
        }
        return Ok(());
    }

    let monitor_enabled = args.monitor_enabled(&config);
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let fetcher = match HttpFetcher::from_config(&config) {
        Ok(fetcher) => fetcher,
        Err(e) => fail("Could not create HTTP client", &e),
    };
    let processor = DataProcessor::new(config.processing.clone());
    let writer = OutputWriter::new(
        LocalStorage::new(config.output_path()),
        OutputSettings::from_config(&config),
    );
    let engine = IngestionEngine::new_with_monitoring(
        fetcher,
        processor,
        writer,
        EngineSettings::from_config(&config),
        monitor_enabled,
    );

    match engine.run(requests).await {
        Ok(report) => {
            tracing::info!(
                "✅ Ingestion complete: {} rows from {}/{} requests ({} dropped, {} duplicates)",
                report.output_rows,
                report.fetched_batches,
                report.requests,
                report.dropped_rows,
                report.duplicate_rows
            );
            if !report.failures.is_empty() {
                tracing::warn!(
                    "⚠️ {} requests failed ({:.0}%): {}",
                    report.failures.len(),
                    report.failure_ratio() * 100.0,
                    report
                        .failures
                        .iter()
                        .map(|f| f.request.key.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            println!("✅ Ingestion completed successfully!");
            for path in &report.outputs {
                println!("📁 {}", path);
            }
        }
        Err(e) => fail("Ingestion failed", &e),
    }

    Ok(())
}
