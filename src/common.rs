use std::fmt;
use std::fmt::{Display, Formatter};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::PersistError;

/// A single spreadsheet cell, reduced to the value shapes the weekly
/// listing sheets actually use. Date-formatted cells arrive already
/// decoded; raw serial numbers stay numeric until a decoder is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
}

impl Cell {
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// The cell's content as text, the way it reads in the sheet.
    /// Whole numbers drop the trailing ".0" that float storage adds.
    pub fn as_string(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            },
            Cell::Text(s) => s.clone(),
            Cell::Bool(b) => b.to_string(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Which serial-date system the workbook uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DateMode {
    #[serde(rename = "1900")]
    Excel1900,
    #[serde(rename = "1904")]
    Excel1904,
}

/// One fully normalized weekly-options listing, keyed by (ticker, list_date).
/// `expirations` always holds exactly the configured number of slots,
/// deduplicated and ascending, padded with None.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyRecord {
    pub ticker: String,
    pub name: String,
    pub product_type: String,
    pub list_date: NaiveDate,
    pub expirations: Vec<Option<NaiveDate>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl Display for UpsertOutcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            UpsertOutcome::Inserted => write!(f, "inserted"),
            UpsertOutcome::Updated => write!(f, "updated"),
        }
    }
}

/// Why a data row produced no record. Not an error: skipped rows are
/// reported through the event sink and the run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BlankTicker,
    NoExpiries,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SkipReason::BlankTicker => write!(f, "blank ticker"),
            SkipReason::NoExpiries => write!(f, "no expiry information"),
        }
    }
}

/// Structured observations emitted by the pipeline, one per section
/// boundary, skipped or failed row, and written record. The core never
/// prints; the binary decides what to do with these.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    SectionFound { index: usize, first_row: usize, row_count: usize },
    SectionFailed { index: usize, message: String },
    ExpiryCellSkipped { row: usize, value: String },
    RowSkipped { row: usize, reason: SkipReason },
    RowFailed { row: usize, message: String },
    RecordWritten { ticker: String, list_date: NaiveDate, outcome: UpsertOutcome },
}

pub trait EventSink {
    fn emit(&mut self, event: IngestEvent);
}

/// Collecting sink for tests and batch inspection.
impl EventSink for Vec<IngestEvent> {
    fn emit(&mut self, event: IngestEvent) {
        self.push(event);
    }
}

/// The persistence contract: insert the record, or overwrite the existing
/// row carrying the same (ticker, list_date) key.
pub trait RecordWriter {
    fn upsert(&mut self, record: &WeeklyRecord) -> Result<UpsertOutcome, PersistError>;
}

#[test]
fn test_cell_blank_and_text() {
    assert!(Cell::Empty.is_blank());
    assert!(Cell::Text("   ".to_owned()).is_blank());
    assert!(!Cell::Number(0.0).is_blank());

    assert_eq!(Cell::Number(45299.0).as_string(), "45299");
    assert_eq!(Cell::Number(1.5).as_string(), "1.5");
    assert_eq!(Cell::Text("ABC".to_owned()).as_string(), "ABC");
}
