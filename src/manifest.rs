// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Project manifest loading
//!
//! A manifest is either a legacy plain list of file names, optionally led
//! by a bracketed header line, or a property-list document whose
//! `<string>NAME.vnm</string>` entries name the files. Relative names are
//! resolved against the manifest's own directory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

const STRUCTURED_DECLARATION: &str = "<?xml";

const STRUCTURED_ENTRY: &str = r"^\s*<string>(.+\.vnm)</string>\s*$";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("cannot open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest entry pattern: {0}")]
    Pattern(#[from] regex::Error),
}

// ============================================================================
// Upload Units
// ============================================================================

/// One source file, ready to be framed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUnit {
    pub name: String,
    /// Source text split after each `\n`, terminators kept.
    pub lines: Vec<String>,
}

impl UploadUnit {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        UploadUnit { name: name.into(), lines }
    }

    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        Self::new(name, text.split_inclusive('\n').map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Legacy,
    Structured,
}

// ============================================================================
// Loading
// ============================================================================

/// Reads the manifest at `path` and every file it names, in order.
pub fn load_manifest(path: &Path) -> Result<Vec<UploadUnit>, ManifestError> {
    ManifestParser::new()?.load(path)
}

/// Manifest reader holding the compiled structured-entry pattern.
pub struct ManifestParser {
    entry: Regex,
}

impl ManifestParser {
    pub fn new() -> Result<Self, ManifestError> {
        Ok(ManifestParser { entry: Regex::new(STRUCTURED_ENTRY)? })
    }

    pub fn load(&self, path: &Path) -> Result<Vec<UploadUnit>, ManifestError> {
        let text = read_text(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));

        let (format, entries) = self.parse(&text);
        debug!(?format, entries = entries.len(), manifest = %path.display(), "Parsed manifest");

        entries
            .into_iter()
            .map(|name| load_unit(base, name))
            .collect()
    }

    /// Extracts the file names listed in a manifest, without touching the filesystem.
    pub fn parse(&self, text: &str) -> (ManifestFormat, Vec<String>) {
        let first = text.lines().map(str::trim).find(|line| !line.is_empty());

        match first {
            Some(line) if line.starts_with(STRUCTURED_DECLARATION) => {
                (ManifestFormat::Structured, self.structured_entries(text))
            }
            _ => (ManifestFormat::Legacy, legacy_entries(text)),
        }
    }

    fn structured_entries(&self, text: &str) -> Vec<String> {
        text.lines()
            .filter_map(|line| self.entry.captures(line))
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

fn legacy_entries(text: &str) -> Vec<String> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let mut entries = Vec::new();

    if let Some(first) = lines.next() {
        if !(first.starts_with('[') && first.ends_with(']')) {
            entries.push(first.to_string());
        }
    }

    entries.extend(lines.map(str::to_string));
    entries
}

fn load_unit(base: &Path, name: String) -> Result<UploadUnit, ManifestError> {
    let path = base.join(&name);
    let text = read_text(&path)?;
    debug!(file = %path.display(), bytes = text.len(), "Loaded source file");
    Ok(UploadUnit::from_text(name, &text))
}

fn read_text(path: &Path) -> Result<String, ManifestError> {
    let mut file = File::open(path).map_err(|source| ManifestError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut text = String::new();
    file.read_to_string(&mut text).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(text)
}

// ============================================================================
// Tests
// ============================================================================
