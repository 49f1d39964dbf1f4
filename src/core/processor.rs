use crate::config::ProcessingConfig;
use crate::core::frame::Frame;
use crate::core::stats;
use crate::domain::model::{ColumnStats, ProcessedDataset, Record};
use crate::domain::ports::Processor;
use crate::utils::error::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Turns raw fetched records into a clean, sorted, de-duplicated frame with
/// derived columns and summary statistics.
pub struct DataProcessor {
    config: ProcessingConfig,
    reference_time: DateTime<Utc>,
}

impl DataProcessor {
    pub fn new(config: ProcessingConfig) -> Self {
        Self {
            config,
            reference_time: Utc::now(),
        }
    }

    /// Pins "now" for `lookback_days`.
    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    /// Renames are applied against the record as fetched: every source is
    /// read before any target is written, so chains and swaps work.
    fn apply_field_mapping(&self, record: &mut Record) {
        let Some(mapping) = &self.config.field_mapping else {
            return;
        };
        let moved: Vec<(&String, Value)> = mapping
            .iter()
            .filter_map(|(source, target)| {
                let value = if source.contains('.') {
                    lookup_path(record, source)
                } else {
                    record.get(source)
                };
                value.cloned().map(|v| (target, v))
            })
            .collect();

        for source in mapping.keys().filter(|source| !source.contains('.')) {
            record.data.remove(source);
        }
        for (target, value) in moved {
            record.insert(target, value);
        }
    }

    fn coerce_numeric(&self, record: &mut Record) {
        for field in &self.config.numeric_fields {
            if !record.data.contains_key(field) {
                continue;
            }
            let value = record
                .get_f64(field)
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            record.insert(field, value);
        }
    }

    /// Normalizes the timestamp field in place and returns the parsed value.
    fn normalize_timestamp(&self, record: &mut Record) -> Option<DateTime<Utc>> {
        let field = self.config.timestamp_field.as_ref()?;
        let raw = record.get(field)?;
        let parsed = parse_timestamp(raw);
        match parsed {
            Some(ts) => record.insert(field, ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => {
                tracing::debug!("Unparseable timestamp in '{}': {}", field, raw);
                record.insert(field, Value::Null);
            }
        }
        parsed
    }

    fn in_window(&self, ts: Option<DateTime<Utc>>) -> bool {
        if !self.config.has_date_window() {
            return true;
        }
        let Some(ts) = ts else {
            return false;
        };
        let date = ts.date_naive();
        if self.config.start_date.is_some_and(|start| date < start) {
            return false;
        }
        if self.config.end_date.is_some_and(|end| date > end) {
            return false;
        }
        // 超出範圍就當作沒有下限
        let earliest = self
            .config
            .lookback_days
            .and_then(Duration::try_days)
            .and_then(|days| self.reference_time.checked_sub_signed(days));
        if earliest.is_some_and(|earliest| ts < earliest) {
            return false;
        }
        true
    }

    fn group_key(&self, record: &Record) -> String {
        self.config
            .group_by
            .as_ref()
            .and_then(|field| record.get(field))
            .map(key_text)
            .unwrap_or_default()
    }

    fn dedupe(&self, rows: Vec<(Record, Option<DateTime<Utc>>)>) -> (Vec<(Record, Option<DateTime<Utc>>)>, usize) {
        if self.config.dedupe_on.is_empty() {
            return (rows, 0);
        }
        let key_of = |record: &Record| -> Vec<String> {
            self.config
                .dedupe_on
                .iter()
                .map(|field| record.get(field).map(key_text).unwrap_or_default())
                .collect()
        };

        let mut last_index: HashMap<Vec<String>, usize> = HashMap::new();
        for (index, (record, _)) in rows.iter().enumerate() {
            last_index.insert(key_of(record), index);
        }

        let before = rows.len();
        let kept: Vec<_> = rows
            .into_iter()
            .enumerate()
            .filter(|(index, (record, _))| last_index.get(&key_of(record)) == Some(index))
            .map(|(_, row)| row)
            .collect();
        let duplicates = before - kept.len();
        (kept, duplicates)
    }

    /// Adds `{field}_pct_change` and `{field}_ma{N}`, computed within each group.
    fn add_derived_columns(&self, frame: &mut Frame) -> Result<Vec<String>> {
        let Some(value_field) = &self.config.value_field else {
            return Ok(Vec::new());
        };

        let values = frame.column_f64(value_field);
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, record) in frame.rows().iter().enumerate() {
            let key = self.group_key(record);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((key, vec![index])),
            }
        }

        let mut pct = vec![None; values.len()];
        let mut rolling = vec![None; values.len()];
        for (_, indices) in &groups {
            let group_values: Vec<Option<f64>> = indices.iter().map(|&i| values[i]).collect();
            for (pos, change) in stats::pct_change(&group_values).into_iter().enumerate() {
                pct[indices[pos]] = change;
            }
            if let Some(window) = self.config.rolling_window {
                for (pos, avg) in stats::rolling_mean(&group_values, window).into_iter().enumerate() {
                    rolling[indices[pos]] = avg;
                }
            }
        }

        let mut derived = Vec::new();
        let pct_name = format!("{}_pct_change", value_field);
        frame.set_column(&pct_name, to_json_numbers(pct))?;
        derived.push(pct_name);

        if let Some(window) = self.config.rolling_window {
            let ma_name = format!("{}_ma{}", value_field, window);
            frame.set_column(&ma_name, to_json_numbers(rolling))?;
            derived.push(ma_name);
        }

        Ok(derived)
    }
}

impl Processor for DataProcessor {
    fn process(&self, records: Vec<Record>) -> Result<ProcessedDataset> {
        tracing::info!("🔧 Processing {} raw records", records.len());
        let input_rows = records.len();

        // 欄位映射、數值轉換與時間正規化
        let mut rows: Vec<(Record, Option<DateTime<Utc>>)> = records
            .into_iter()
            .map(|mut record| {
                self.apply_field_mapping(&mut record);
                self.coerce_numeric(&mut record);
                let ts = self.normalize_timestamp(&mut record);
                (record, ts)
            })
            .collect();

        // 過濾缺少必要欄位或不在日期範圍內的資料
        rows.retain(|(record, ts)| {
            !self.config.required_fields.iter().any(|f| record.is_missing(f)) && self.in_window(*ts)
        });
        let dropped_rows = input_rows - rows.len();
        if dropped_rows > 0 {
            tracing::warn!("⚠️ Dropped {} rows (missing fields or outside date window)", dropped_rows);
        }

        if self.config.group_by.is_some() || self.config.timestamp_field.is_some() {
            rows.sort_by(|(a, a_ts), (b, b_ts)| {
                self.group_key(a)
                    .cmp(&self.group_key(b))
                    .then_with(|| a_ts.cmp(b_ts))
            });
        }

        let (rows, duplicate_rows) = self.dedupe(rows);
        if duplicate_rows > 0 {
            tracing::info!("🧹 Removed {} duplicate rows", duplicate_rows);
        }

        let mut frame = Frame::from_records(rows.into_iter().map(|(record, _)| record).collect());
        let derived = self.add_derived_columns(&mut frame)?;

        if let Some(columns) = &self.config.columns {
            let mut projection = columns.clone();
            for name in &derived {
                if !projection.contains(name) {
                    projection.push(name.clone());
                }
            }
            frame.select(&projection);
        }

        let summary: Vec<ColumnStats> = self
            .config
            .numeric_fields
            .iter()
            .chain(derived.iter())
            .filter(|column| frame.has_column(column))
            .map(|column| stats::describe(column, &frame.column_f64(column)))
            .collect();

        tracing::info!(
            "✅ Processing complete: {} rows, {} columns",
            frame.len(),
            frame.columns().len()
        );

        Ok(ProcessedDataset {
            frame,
            summary,
            dropped_rows,
            duplicate_rows,
        })
    }
}

fn lookup_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_json_numbers(values: Vec<Option<f64>>) -> Vec<Value> {
    values
        .into_iter()
        .map(|v| {
            v.and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, and unix epoch
/// seconds or milliseconds (as numbers or numeric strings).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // Anything past year 5138 in seconds is read as milliseconds
    if value.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}
