use crate::config::IngestConfig;
use crate::domain::model::{FetchFailure, ProcessedDataset};
use crate::domain::ports::Storage;
use crate::utils::error::Result;
use std::io::Write;
use zip::write::{FileOptions, ZipWriter};

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub file_stem: String,
    pub formats: Vec<String>,
    pub include_summary: bool,
    pub compress: bool,
    pub archive_name: Option<String>,
    /// Directory shown in reported paths; storage decides where files land.
    pub display_root: String,
}

impl OutputSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            file_stem: config.file_stem().to_string(),
            formats: config.output.formats.clone(),
            include_summary: config.output.include_summary,
            compress: config.compression_enabled(),
            archive_name: config
                .output
                .compression
                .as_ref()
                .and_then(|c| c.filename.clone()),
            display_root: config.output_path().to_string(),
        }
    }
}

/// Writes the processed dataset and its side files through a `Storage`.
pub struct OutputWriter<S: Storage> {
    storage: S,
    settings: OutputSettings,
}

impl<S: Storage> OutputWriter<S> {
    pub fn new(storage: S, settings: OutputSettings) -> Self {
        Self { storage, settings }
    }

    /// Renders every output file in memory as (name, bytes).
    fn render(
        &self,
        dataset: &ProcessedDataset,
        failures: &[FetchFailure],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let stem = &self.settings.file_stem;
        let mut files = Vec::new();

        for format in &self.settings.formats {
            match format.as_str() {
                "csv" => files.push((format!("{}.csv", stem), dataset.frame.to_csv()?.into_bytes())),
                "json" => files.push((format!("{}.json", stem), dataset.frame.to_json()?.into_bytes())),
                other => tracing::warn!("Skipping unsupported output format '{}'", other),
            }
        }

        if self.settings.include_summary {
            let summary = serde_json::to_string_pretty(&dataset.summary)?;
            files.push((format!("{}_summary.json", stem), summary.into_bytes()));
        }

        if !failures.is_empty() {
            let report = serde_json::to_string_pretty(failures)?;
            files.push((format!("{}_failures.json", stem), report.into_bytes()));
        }

        Ok(files)
    }

    /// Returns the paths written, prefixed with the configured output root.
    pub async fn write(
        &self,
        dataset: &ProcessedDataset,
        failures: &[FetchFailure],
    ) -> Result<Vec<String>> {
        let files = self.render(dataset, failures)?;

        let written: Vec<String> = if self.settings.compress {
            let archive_name = self
                .settings
                .archive_name
                .clone()
                .unwrap_or_else(|| format!("{}.zip", self.settings.file_stem));
            tracing::debug!("Creating ZIP file with {} files", files.len());

            let zip_data = {
                let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
                for (name, data) in &files {
                    zip.start_file::<_, ()>(name.as_str(), FileOptions::default())?;
                    zip.write_all(data)?;
                }
                zip.finish()?.into_inner()
            };

            tracing::debug!("Writing ZIP file ({} bytes) to storage", zip_data.len());
            self.storage.write_file(&archive_name, &zip_data).await?;
            vec![archive_name]
        } else {
            let mut names = Vec::with_capacity(files.len());
            for (name, data) in files {
                self.storage.write_file(&name, &data).await?;
                names.push(name);
            }
            names
        };

        let paths: Vec<String> = written
            .into_iter()
            .map(|name| format!("{}/{}", self.settings.display_root.trim_end_matches('/'), name))
            .collect();
        for path in &paths {
            tracing::info!("💾 Wrote {}", path);
        }
        Ok(paths)
    }
}
