//! End-of-run report: every (screen, device) pair with its terminal status.

use crate::models::{CaptureResult, CaptureStatus};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;

pub const REPORT_FILE_NAME: &str = "report.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub captured: usize,
    pub failed: usize,
    pub unreachable: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: Summary,
    pub results: Vec<CaptureResult>,
}

impl RunReport {
    pub fn new(results: Vec<CaptureResult>) -> Self {
        let mut summary = Summary {
            total: results.len(),
            ..Summary::default()
        };
        for r in &results {
            match r.status {
                CaptureStatus::Captured => summary.captured += 1,
                CaptureStatus::Failed => summary.failed += 1,
                CaptureStatus::Unreachable => summary.unreachable += 1,
            }
        }
        Self { summary, results }
    }

    /// True when every pair was captured.
    pub fn is_complete(&self) -> bool {
        self.summary.captured == self.summary.total
    }

    /// Human-readable table, grouped by device in result order.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let screen_width = self
            .results
            .iter()
            .map(|r| r.screen_id.len())
            .max()
            .unwrap_or(0)
            .max("SCREEN".len());

        let mut current_device: Option<&str> = None;
        for r in &self.results {
            if current_device != Some(r.device.as_str()) {
                if current_device.is_some() {
                    out.push('\n');
                }
                let _ = writeln!(out, "{}", r.device);
                current_device = Some(r.device.as_str());
            }
            let detail = match (&r.status, &r.output_path, &r.reason) {
                (CaptureStatus::Captured, Some(path), _) => path.to_string(),
                (_, _, Some(reason)) => reason.clone(),
                _ => String::new(),
            };
            let _ = writeln!(
                out,
                "  {:<width$}  {:<11}  {}",
                r.screen_id,
                r.status.to_string(),
                detail,
                width = screen_width
            );
        }

        if !self.results.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "{} pairs: {} captured, {} failed, {} unreachable",
            self.summary.total, self.summary.captured, self.summary.failed, self.summary.unreachable
        );
        out
    }

    /// Write the report as YAML into `dir`, returning the file path.
    pub fn write_yaml(&self, dir: &Utf8Path) -> Result<Utf8PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir))?;
        let path = dir.join(REPORT_FILE_NAME);
        let yaml = serde_yaml_ng::to_string(self).context("Failed to serialize report to YAML")?;
        fs::write(&path, yaml).with_context(|| format!("Failed to write report: {}", path))?;
        tracing::info!("Wrote report to {}", path);
        Ok(path)
    }
}
