//! Rally entry list export
//!
//! Fetches the event entry feed from a rally timing server and flattens it
//! into a five-column headered CSV (`No, Driver, Champs, Co-Driver, Car`).
//! Companion feature to the caption pipeline; shares nothing with it beyond
//! the error type.

use std::path::{Path, PathBuf};
use serde::Deserialize;
use tracing::info;

use crate::error::{CaptionError, Result};

pub const DEFAULT_CSV_FILENAME: &str = "rally_entries.csv";

const CSV_HEADERS: [&str; 5] = ["No", "Driver", "Champs", "Co-Driver", "Car"];

/// Feeds emit car numbers as either JSON numbers or strings depending on the
/// server revision; accept both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberField {
    Int(i64),
    Text(String),
}

impl NumberField {
    fn as_text(&self) -> String {
        match self {
            NumberField::Int(n) => n.to_string(),
            NumberField::Text(s) => s.clone(),
        }
    }
}

/// One raw record from `entries_get.php`.
#[derive(Debug, Clone, Deserialize)]
pub struct RallyEntry {
    pub no: NumberField,
    pub pe_name_d: String,
    pub champ_d: String,
    pub pe_name_n: String,
    pub ca_make: String,
    pub ca_model: String,
}

/// One flattened output row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRow {
    pub no: String,
    pub driver: String,
    pub champs: String,
    pub co_driver: String,
    pub car: String,
}

pub struct RallyClient {
    base: String,
}

impl RallyClient {
    /// Build a client from any URL on the timing server; the entry endpoint
    /// lives next to it.
    ///
    /// The base is the URL's directory: a page URL loses its final path
    /// segment, while a URL ending in `/` (or a bare host) is already a
    /// directory and only loses the trailing slash. So both
    /// `https://host/rally24/entries.php` and `https://host/rally24/` give
    /// `https://host/rally24`, and `https://host/` gives `https://host`.
    pub fn from_url(input_url: &str) -> Result<Self> {
        let (scheme, rest) = input_url
            .split_once("://")
            .ok_or_else(|| CaptionError::InvalidUrl(input_url.to_string()))?;
        if !matches!(scheme, "http" | "https") {
            return Err(CaptionError::InvalidUrl(input_url.to_string()));
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(CaptionError::InvalidUrl(input_url.to_string()));
        }

        let dir = if path.ends_with('/') || path.is_empty() {
            path.trim_end_matches('/')
        } else {
            path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
        };
        let base = if dir.is_empty() {
            format!("{scheme}://{authority}")
        } else {
            format!("{scheme}://{authority}/{dir}")
        };
        Ok(Self { base })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Fetch the solo entry list (`type=s`, combined and mixed classes
    /// excluded).
    pub fn fetch_entries(&self) -> Result<Vec<RallyEntry>> {
        let url = format!("{}/entries_get.php?type=s&combined=0&mixed=0", self.base);
        info!("fetching rally entries from {url}");
        let response = reqwest::blocking::get(&url)?;
        if !response.status().is_success() {
            return Err(CaptionError::Backend(format!(
                "entry feed returned {}",
                response.status()
            )));
        }
        Ok(response.json()?)
    }
}

/// Flatten raw entries into output rows, merging make and model into one
/// `Car` column.
pub fn flatten(entries: &[RallyEntry]) -> Vec<EntryRow> {
    entries
        .iter()
        .map(|e| EntryRow {
            no: e.no.as_text(),
            driver: e.pe_name_d.clone(),
            champs: e.champ_d.clone(),
            co_driver: e.pe_name_n.clone(),
            car: format!("{} {}", e.ca_make, e.ca_model),
        })
        .collect()
}

/// Write the rows as a headered CSV into `dir` (created if absent). Returns
/// the written path.
pub fn export_csv(rows: &[EntryRow], dir: &Path, filename: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(filename);

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(CSV_HEADERS)?;
    for row in rows {
        writer.write_record([&row.no, &row.driver, &row.champs, &row.co_driver, &row.car])?;
    }
    writer.flush()?;

    info!("rally entries exported to {}", path.display());
    Ok(path)
}
