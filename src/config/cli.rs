use crate::config::toml_config::IngestConfig;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "market-ingest")]
#[command(about = "Rate-limited market data ingestion with isolated processing")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "ingest-config.toml")]
    pub config: String,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Override monitoring setting from config
    #[arg(long)]
    pub monitor: Option<bool>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    /// Override the configured symbols
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Override the output directory
    #[arg(long)]
    pub output: Option<String>,

    /// Show the planned requests without fetching anything
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    /// 應用命令列覆蓋設定
    pub fn apply_overrides(&self, config: &mut IngestConfig) {
        if !self.symbols.is_empty() {
            tracing::info!("🔧 Symbols overridden to: {}", self.symbols.join(","));
            config.source.symbols = self.symbols.clone();
        }
        if let Some(output) = &self.output {
            tracing::info!("🔧 Output path overridden to: {}", output);
            config.output.path = output.clone();
        }
    }

    pub fn monitor_enabled(&self, config: &IngestConfig) -> bool {
        self.monitor.unwrap_or_else(|| config.monitoring_enabled())
    }
}
