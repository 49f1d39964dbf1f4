//! Column statistics over optional numeric values. Missing values are skipped
//! by the aggregates and propagate as `None` through the element-wise series.

use crate::domain::model::ColumnStats;

fn present(values: &[Option<f64>]) -> impl Iterator<Item = f64> + '_ {
    values.iter().flatten().copied()
}

pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let (sum, count) = present(values).fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std(values: &[Option<f64>]) -> Option<f64> {
    let count = present(values).count();
    if count < 2 {
        return None;
    }
    let mean = mean(values)?;
    let variance = present(values).map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
    Some(variance.sqrt())
}

pub fn min(values: &[Option<f64>]) -> Option<f64> {
    present(values).reduce(f64::min)
}

pub fn max(values: &[Option<f64>]) -> Option<f64> {
    present(values).reduce(f64::max)
}

/// Relative change from the previous element. `None` at the first position,
/// next to a missing value, or when the previous value is zero.
pub fn pct_change(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let change = match (i.checked_sub(1).and_then(|p| values[p]), values[i]) {
            (Some(prev), Some(curr)) if prev != 0.0 => Some((curr - prev) / prev),
            _ => None,
        };
        out.push(change);
    }
    out
}

/// Trailing mean over `window` positions. A window containing a missing value
/// yields `None`, as do the first `window - 1` positions.
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    (0..values.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            if slice.iter().any(Option::is_none) {
                None
            } else {
                mean(slice)
            }
        })
        .collect()
}

pub fn describe(column: &str, values: &[Option<f64>]) -> ColumnStats {
    let count = present(values).count();
    ColumnStats {
        column: column.to_string(),
        count,
        missing: values.len() - count,
        mean: mean(values),
        std: sample_std(values),
        min: min(values),
        max: max(values),
    }
}
