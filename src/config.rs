use std::collections::HashMap;
use std::fs;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::common::DateMode;
use crate::error::IngestError;

// The CBOE has published the phrase both with and without the plural "s".
const START_PATTERN: &str = "list of available weeklys? options";
const HEADER_PATTERN: &str = "ticker symbol";
const FLAG_TOKEN: &str = "x";
const STRIP_MARKER: &str = "*";
const EXPIRY_SLOTS: usize = 7;

/// Everything the parser needs to know about the sheet layout. Defaults
/// cover the published format; a TOML file can override any field when
/// the vendor shifts the layout again.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub start_pattern: String,  // regex, matched case-insensitively against first cells
    pub header_pattern: String, // regex, same treatment
    pub flag_token: String,     // marks a weekly-type column as applicable
    pub strip_marker: String,   // footnote character removed from text fields
    pub expiry_slots: usize,    // expiry_0 .. expiry_{N-1}
    pub date_mode: DateMode,
    pub aliases: HashMap<String, Vec<String>>,
}

impl Default for IngestConfig {
    fn default() -> IngestConfig {
        IngestConfig {
            start_pattern: START_PATTERN.to_owned(),
            header_pattern: HEADER_PATTERN.to_owned(),
            flag_token: FLAG_TOKEN.to_owned(),
            strip_marker: STRIP_MARKER.to_owned(),
            expiry_slots: EXPIRY_SLOTS,
            date_mode: DateMode::Excel1900,
            aliases: default_aliases(),
        }
    }
}

/// The canonical-field alias table: each output field, with the source
/// header spellings accepted for it, in lookup order.
fn default_aliases() -> HashMap<String, Vec<String>> {
    let mut aliases = HashMap::new();
    aliases.insert(
        "ticker".to_owned(),
        vec!["ticker symbol".to_owned(), "ticker".to_owned(), "symbol".to_owned()],
    );
    aliases.insert(
        "name".to_owned(),
        vec!["name".to_owned(), "company name".to_owned(), "security name".to_owned()],
    );
    aliases.insert(
        "type".to_owned(),
        vec!["type".to_owned(), "product type".to_owned()],
    );
    aliases.insert(
        "list_date".to_owned(),
        vec!["list date".to_owned(), "date listed".to_owned(), "initial list date".to_owned()],
    );
    aliases
}

impl IngestConfig {
    pub fn start_regex(&self) -> Result<Regex, IngestError> {
        compile_pattern(&self.start_pattern)
    }

    pub fn header_regex(&self) -> Result<Regex, IngestError> {
        compile_pattern(&self.header_pattern)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, IngestError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| IngestError::Config {
            path: pattern.to_owned(),
            message: e.to_string(),
        })
}

/// Reads the ingest configuration, falling back to the built-in defaults
/// when the file does not exist. A file that exists but fails to parse is
/// an error, not a silent fallback.
pub fn load_ingest_config(path: &str) -> Result<IngestConfig, IngestError> {
    match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw).map_err(|e| IngestError::Config {
            path: path.to_owned(),
            message: e.to_string(),
        }),
        Err(_) => Ok(IngestConfig::default()),
    }
}

/// Private configuration (passwords, database names). Same shape and
/// same optional treatment as the scraper configs: absence is fine.
pub type SecretConfig = HashMap<String, HashMap<String, String>>;

pub fn load_secret_config(path: &str) -> Option<SecretConfig> {
    match fs::read_to_string(path) {
        Ok(s) => Some(toml::from_str(&s).expect("Secret configuration exists yet failed to process as a TOML file.")),
        Err(_) => None,
    }
}

#[test]
fn test_default_config() {
    let config = IngestConfig::default();

    assert_eq!(config.expiry_slots, 7);
    assert_eq!(config.date_mode, DateMode::Excel1900);
    assert!(config.aliases["ticker"].contains(&"ticker symbol".to_owned()));

    let start = config.start_regex().unwrap();
    assert!(start.is_match("LIST OF AVAILABLE WEEKLYS OPTIONS"));
    assert!(start.is_match("List of Available Weekly Options"));
    assert!(!start.is_match("Ticker Symbol"));

    let header = config.header_regex().unwrap();
    assert!(header.is_match("Ticker Symbol | Name | Type"));
}

#[test]
fn test_config_override() {
    let raw = r##"
        expiry_slots = 6
        date_mode = "1904"
        strip_marker = "#"
    "##;

    let config: IngestConfig = toml::from_str(raw).unwrap();
    assert_eq!(config.expiry_slots, 6);
    assert_eq!(config.date_mode, DateMode::Excel1904);
    assert_eq!(config.strip_marker, "#");
    // untouched fields keep their defaults
    assert_eq!(config.header_pattern, "ticker symbol");
}

#[test]
fn test_config_rejects_bad_pattern() {
    let config = IngestConfig {
        start_pattern: "(".to_owned(),
        ..IngestConfig::default()
    };
    assert!(config.start_regex().is_err());
}
