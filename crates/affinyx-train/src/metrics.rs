//! Regression metrics and the results tables they are written to.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub cindex: f64,
    pub pearson: f64,
    pub spearman: f64,
    pub mse: f64,
    pub mae: f64,
    pub rmse: f64,
}

impl RegressionMetrics {
    pub fn compute(preds: &[f64], targets: &[f64]) -> Result<Self> {
        if preds.len() != targets.len() {
            return Err(TrainError::Data(format!(
                "{} predictions for {} targets",
                preds.len(),
                targets.len()
            )));
        }
        if preds.is_empty() {
            return Err(TrainError::Data("no predictions to score".into()));
        }
        let n = preds.len() as f64;
        let mse = preds.iter().zip(targets).map(|(p, t)| (p - t).powi(2)).sum::<f64>() / n;
        let mae = preds.iter().zip(targets).map(|(p, t)| (p - t).abs()).sum::<f64>() / n;
        Ok(Self {
            cindex: concordance_index(targets, preds),
            pearson: pearson(preds, targets),
            spearman: pearson(&ranks(preds), &ranks(targets)),
            mse,
            mae,
            rmse: mse.sqrt(),
        })
    }
}

/// Fraction of comparable pairs (different targets) ordered the same way by
/// the predictions; prediction ties count one half.
pub fn concordance_index(targets: &[f64], preds: &[f64]) -> f64 {
    let mut concordant = 0.0;
    let mut pairs = 0usize;
    for i in 0..targets.len() {
        for j in 0..targets.len() {
            if targets[i] > targets[j] {
                pairs += 1;
                if preds[i] > preds[j] {
                    concordant += 1.0;
                } else if preds[i] == preds[j] {
                    concordant += 0.5;
                }
            }
        }
    }
    if pairs == 0 {
        0.0
    } else {
        concordant / pairs as f64
    }
}

/// Pearson correlation; 0 when either side is constant.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        0.0
    } else {
        sxy / (sxx.sqrt() * syy.sqrt())
    }
}

/// 1-based ranks with ties sharing their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            out[k] = avg;
        }
        i = j + 1;
    }
    out
}

/// One row of `model_stats.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRow {
    pub run: String,
    pub cindex: f64,
    pub pearson: f64,
    pub spearman: f64,
    pub mse: f64,
    pub mae: f64,
    pub rmse: f64,
}

impl StatsRow {
    pub fn new(run: &str, m: &RegressionMetrics) -> Self {
        Self {
            run: run.to_string(),
            cindex: m.cindex,
            pearson: m.pearson,
            spearman: m.spearman,
            mse: m.mse,
            mae: m.mae,
            rmse: m.rmse,
        }
    }
}

pub fn read_stats(path: &Path) -> Result<Vec<StatsRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<std::result::Result<Vec<StatsRow>, _>>()?;
    Ok(rows)
}

/// Insert or replace the row for `row.run`, keeping the other rows in order.
pub fn upsert_stats(path: &Path, row: StatsRow) -> Result<()> {
    let mut rows = read_stats(path)?;
    match rows.iter_mut().find(|r| r.run == row.run) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("csv.partial");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for r in &rows {
            writer.serialize(r)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_perfect_predictions() {
        let y = [1.0, 2.0, 3.0, 4.0];
        let m = RegressionMetrics::compute(&y, &y).unwrap();
        assert_eq!(m.cindex, 1.0);
        assert!((m.pearson - 1.0).abs() < 1e-12);
        assert!((m.spearman - 1.0).abs() < 1e-12);
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.rmse, 0.0);
    }

    #[test]
    fn test_known_values() {
        let targets = [1.0, 2.0, 3.0];
        let preds = [3.0, 2.0, 1.0];
        let m = RegressionMetrics::compute(&preds, &targets).unwrap();
        assert_eq!(m.cindex, 0.0);
        assert!((m.pearson + 1.0).abs() < 1e-12);
        assert!((m.mse - 8.0 / 3.0).abs() < 1e-12);
        assert!((m.mae - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_cindex_counts_ties_as_half() {
        assert_eq!(concordance_index(&[1.0, 2.0], &[5.0, 5.0]), 0.5);
    }

    #[test]
    fn test_ranks_average_ties() {
        assert_eq!(ranks(&[10.0, 20.0, 10.0, 30.0]), vec![1.5, 3.0, 1.5, 4.0]);
    }

    #[test]
    fn test_mismatched_lengths() {
        assert!(RegressionMetrics::compute(&[1.0], &[]).is_err());
    }

    #[test]
    fn test_upsert_replaces_row_with_same_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("media").join("model_stats.csv");
        let m = RegressionMetrics { cindex: 0.7, pearson: 0.5, spearman: 0.4, mse: 1.0, mae: 0.8, rmse: 1.0 };

        upsert_stats(&path, StatsRow::new("a", &m)).unwrap();
        upsert_stats(&path, StatsRow::new("b", &m)).unwrap();
        upsert_stats(&path, StatsRow::new("a", &RegressionMetrics { mse: 0.25, ..m })).unwrap();

        let rows = read_stats(&path).unwrap();
        assert_eq!(rows.iter().map(|r| r.run.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(rows[0].mse, 0.25);

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("run,cindex,pearson,spearman,mse,mae,rmse"));
    }
}
