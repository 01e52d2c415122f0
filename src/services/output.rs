//! Screenshot addressing.
//!
//! The path of a capture depends only on the output settings, the device name and the
//! screen's capture name, so re-running a plan overwrites the same files.

use crate::models::{OrganizeBy, OutputConfig};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

#[derive(Debug, Clone)]
pub struct OutputLayout {
    directory: Utf8PathBuf,
    organize_by: OrganizeBy,
    format: String,
}

impl OutputLayout {
    pub fn new(
        directory: impl Into<Utf8PathBuf>,
        organize_by: OrganizeBy,
        format: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            organize_by,
            format: format.into(),
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.directory.clone(), config.organize_by, config.format.clone())
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    /// `<dir>/<device>/<capture>.<fmt>` or `<dir>/<capture>/<device>.<fmt>`.
    pub fn capture_path(&self, device: &str, capture_name: &str) -> Utf8PathBuf {
        let device = sanitize_name(device);
        let capture = sanitize_name(capture_name);
        let (folder, file) = match self.organize_by {
            OrganizeBy::Device => (device, capture),
            OrganizeBy::Screen => (capture, device),
        };
        self.directory.join(folder).join(format!("{}.{}", file, self.format))
    }

    /// Create the parent directory of `path`.
    pub fn prepare(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory: {}", parent))?;
        }
        Ok(())
    }
}

/// Keep names readable but safe as a single path component.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
