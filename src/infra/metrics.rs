// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Records per-epoch loss terms to a CSV file.
//
// Which terms exist depends on the policy (l1/kl for ACT,
// mse for CNN-MLP, l2_loss for diffusion), so the header is
// written from the first logged row:
//
//   epoch,train_l1,train_kl,train_loss,val_l1,val_kl,val_loss
//   1,0.512300,0.021000,0.722300,0.498100,0.019800,0.696100
//
// Output file: checkpoints/metrics.csv

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};

/// Mean loss terms of one epoch, in the order the policy reports them.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: Vec<(String, f64)>,
    pub val:   Vec<(String, f64)>,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train: Vec<(String, f64)>, val: Vec<(String, f64)>) -> Self {
        Self { epoch, train, val }
    }

    fn lookup(terms: &[(String, f64)], name: &str) -> f64 {
        terms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .unwrap_or(f64::NAN)
    }

    pub fn train_loss(&self) -> f64 {
        Self::lookup(&self.train, "loss")
    }

    pub fn val_loss(&self) -> f64 {
        Self::lookup(&self.val, "loss")
    }

    /// Loss used to pick the best checkpoint: validation when there
    /// is any, training otherwise.
    pub fn selection_loss(&self) -> f64 {
        let val = self.val_loss();
        if val.is_finite() { val } else { self.train_loss() }
    }

    /// Returns true if this epoch improved over the previous best loss
    pub fn is_improvement(&self, best_loss: f64) -> bool {
        self.selection_loss() < best_loss
    }

    fn header(&self) -> String {
        let names = |prefix: &str, terms: &[(String, f64)]| -> Vec<String> {
            terms.iter().map(|(n, _)| format!("{prefix}_{n}")).collect()
        };
        let mut cols = vec!["epoch".to_string()];
        cols.extend(names("train", &self.train));
        cols.extend(names("val", &self.val));
        cols.join(",")
    }

    fn row(&self) -> String {
        let mut cols = vec![self.epoch.to_string()];
        cols.extend(self.train.iter().chain(&self.val).map(|(_, v)| format!("{v:.6}")));
        cols.join(",")
    }
}

/// Logs epoch metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create metrics directory '{}'", dir.display()))?;
        Ok(Self { csv_path: dir.join("metrics.csv") })
    }

    /// Append one epoch's metrics, writing the header first if the
    /// file is new.
    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let is_new = !self.csv_path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;
        if is_new {
            writeln!(f, "{}", m.header())?;
            tracing::debug!("Created metrics CSV: '{}'", self.csv_path.display());
        }
        writeln!(f, "{}", m.row())?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, val_loss={:.4}",
            m.epoch,
            m.train_loss(),
            m.val_loss(),
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(l1: f64, loss: f64) -> Vec<(String, f64)> {
        vec![("l1".into(), l1), ("loss".into(), loss)]
    }

    #[test]
    fn test_is_improvement() {
        let m = EpochMetrics::new(2, terms(0.3, 2.5), terms(0.2, 2.3));
        assert!(m.is_improvement(3.0));
        assert!(!m.is_improvement(2.0));
    }

    #[test]
    fn test_selection_falls_back_to_train_loss() {
        let m = EpochMetrics::new(1, terms(0.3, 1.5), vec![]);
        assert!(m.val_loss().is_nan());
        assert_eq!(m.selection_loss(), 1.5);
    }

    #[test]
    fn test_csv_header_written_once() {
        let tmp    = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(tmp.path()).unwrap();
        logger.log(&EpochMetrics::new(1, terms(0.5, 0.7), terms(0.4, 0.6))).unwrap();
        logger.log(&EpochMetrics::new(2, terms(0.25, 0.5), terms(0.2, 0.4))).unwrap();

        let text  = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "epoch,train_l1,train_loss,val_l1,val_loss");
        assert_eq!(lines[1], "1,0.500000,0.700000,0.400000,0.600000");
        assert_eq!(lines.len(), 3);
    }
}
