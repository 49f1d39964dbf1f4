use crate::domain::model::Record;
use crate::utils::error::{IngestError, Result};
use serde_json::Value;

/// Ordered tabular view over records. Rows keep their own maps; the frame
/// owns the column order used for export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Frame {
    /// Column order follows the first time each key is seen.
    pub fn from_records(rows: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.data.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn column_f64(&self, name: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|row| row.get_f64(name)).collect()
    }

    /// Adds or replaces a column. `values` must have one entry per row.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(IngestError::ProcessingError {
                message: format!(
                    "column '{}' has {} values but frame has {} rows",
                    name,
                    values.len(),
                    self.rows.len()
                ),
            });
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.insert(name, value);
        }
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
        Ok(())
    }

    /// Keeps only the listed columns, in the listed order. Unknown names are
    /// kept as empty columns so the export header stays stable.
    pub fn select(&mut self, columns: &[String]) {
        for row in &mut self.rows {
            row.data.retain(|key, _| columns.contains(key));
        }
        self.columns = columns.to_vec();
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(self.columns.iter().map(|c| cell_text(row.get(c))))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| IngestError::IoError(e.into_error()))?;
        String::from_utf8(bytes).map_err(|e| IngestError::ProcessingError {
            message: format!("CSV output is not valid UTF-8: {}", e),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.rows)?)
    }
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Frame {
        Frame::from_records(vec![
            Record::new().with("symbol", "AAPL").with("close", 187.5),
            Record::new()
                .with("symbol", "MSFT")
                .with("close", 410.0)
                .with("volume", 1000),
        ])
    }

    #[test]
    fn test_columns_follow_first_seen_order() {
        let frame = sample();
        // Keys within a row are sorted, so "close" precedes "symbol"
        assert_eq!(frame.columns(), &["close", "symbol", "volume"]);
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn test_to_csv_leaves_missing_cells_empty() {
        let csv = sample().to_csv().unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "close,symbol,volume");
        assert_eq!(lines[1], "187.5,AAPL,");
        assert_eq!(lines[2], "410.0,MSFT,1000");
    }

    #[test]
    fn test_to_csv_quotes_when_needed() {
        let frame = Frame::from_records(vec![Record::new()
            .with("name", "Apple, Inc.")
            .with("tags", json!(["tech", "large-cap"]))]);
        let csv = frame.to_csv().unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[1], r#""Apple, Inc.","[""tech"",""large-cap""]""#);
    }

    #[test]
    fn test_set_column_checks_length() {
        let mut frame = sample();
        assert!(frame
            .set_column("flag", vec![json!(true), json!(false)])
            .is_ok());
        assert!(frame.has_column("flag"));
        assert!(frame.set_column("bad", vec![json!(1)]).is_err());
    }

    #[test]
    fn test_select_projects_and_orders() {
        let mut frame = sample();
        frame.select(&["symbol".to_string(), "close".to_string()]);
        assert_eq!(frame.columns(), &["symbol", "close"]);
        assert!(frame.rows()[1].get("volume").is_none());

        let csv = frame.to_csv().unwrap();
        assert_eq!(csv.lines().next().unwrap(), "symbol,close");
    }

    #[test]
    fn test_column_f64() {
        let frame = sample();
        assert_eq!(frame.column_f64("volume"), vec![None, Some(1000.0)]);
    }

    #[test]
    fn test_to_json_is_array_of_rows() {
        let json: Vec<serde_json::Value> =
            serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json.len(), 2);
        assert_eq!(json[1]["symbol"], "MSFT");
    }
}
