use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate};
use regex::Regex;

use crate::common::{Cell, DateMode};
use crate::error::LoadError;

// Largest serial Excel itself will render as a date (9999-12-31).
const MAX_SERIAL_DAYS: i64 = 2_958_465;

/// The raw cell grid of one worksheet, read once and never mutated.
/// Carries the serial-date mode so callers can decode numeric dates
/// consistently for the whole sheet.
#[derive(Debug)]
pub struct SheetGrid {
    pub rows: Vec<Vec<Cell>>,
    pub date_mode: DateMode,
}

/// Reads the first worksheet of an xls/xlsx/ods file into a grid.
pub fn load_grid<P: AsRef<Path>>(path: P, date_mode: DateMode) -> Result<SheetGrid, LoadError> {
    let path = path.as_ref();
    let mut workbook = open_workbook_auto(path).map_err(|e| LoadError::Workbook {
        path: path.display().to_string(),
        source: e,
    })?;

    let sheet_names = workbook.sheet_names().to_owned();
    let first_sheet = match sheet_names.first() {
        Some(name) => name.clone(),
        None => {
            return Err(LoadError::NoWorksheet {
                path: path.display().to_string(),
            });
        }
    };

    let range = workbook.worksheet_range(&first_sheet).map_err(|e| LoadError::Workbook {
        path: path.display().to_string(),
        source: e,
    })?;

    let rows = range
        .rows()
        .map(|row| row.iter().map(convert_cell).collect())
        .collect();

    Ok(SheetGrid { rows, date_mode })
}

fn convert_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::String(s) => Cell::Text(s.clone()),
        Data::Bool(b) => Cell::Bool(*b),
        Data::Error(_) => Cell::Empty,
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) => Cell::Date(ts.date()),
            None => Cell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) => Cell::Text(s.clone()),
        Data::DurationIso(s) => Cell::Text(s.clone()),
    }
}

impl DateMode {
    /// Serial day count to calendar date. The 1900 system counts from
    /// 1899-12-31 and contains a phantom 1900-02-29 at serial 60; the
    /// 1904 system counts from 1904-01-01 with no such quirk.
    pub fn decode_serial(self, serial: f64) -> Option<NaiveDate> {
        let days = serial.trunc() as i64;
        if days > MAX_SERIAL_DAYS {
            return None;
        }

        match self {
            DateMode::Excel1900 => {
                if days < 1 {
                    return None;
                }
                let days = if days > 59 { days - 1 } else { days };
                NaiveDate::from_ymd_opt(1899, 12, 31)?.checked_add_signed(Duration::days(days))
            },
            DateMode::Excel1904 => {
                if days < 0 {
                    return None;
                }
                NaiveDate::from_ymd_opt(1904, 1, 1)?.checked_add_signed(Duration::days(days))
            },
        }
    }
}

/// Numbers like 20240105 read as literal year/month/day digits.
fn decode_yyyymmdd(value: f64) -> Option<NaiveDate> {
    if value.fract() != 0.0 {
        return None;
    }

    let digits = value as i64;
    if digits < 10_000_000 || digits > 99_991_231 {
        return None;
    }

    NaiveDate::from_ymd_opt(
        (digits / 10_000) as i32,
        ((digits / 100) % 100) as u32,
        (digits % 100) as u32,
    )
}

fn decode_text_date(text: &str) -> Option<NaiveDate> {
    lazy_static! {
        static ref RE_ISO_DATE: Regex =
            Regex::new(r"(?P<year>\d{4})-(?P<month>\d{1,2})-(?P<day>\d{1,2})").unwrap();
        static ref RE_US_DATE: Regex =
            Regex::new(r"(?P<month>\d{1,2})/(?P<day>\d{1,2})/(?P<year>\d{4})").unwrap();
    }

    let captures = RE_ISO_DATE.captures(text).or_else(|| RE_US_DATE.captures(text))?;

    NaiveDate::from_ymd_opt(
        captures.name("year").unwrap().as_str().parse::<i32>().unwrap(),
        captures.name("month").unwrap().as_str().parse::<u32>().unwrap(),
        captures.name("day").unwrap().as_str().parse::<u32>().unwrap(),
    )
}

impl SheetGrid {
    /// Decodes any cell encoding of a calendar date the listing sheets
    /// use. Returns None when the cell carries no recognizable date.
    pub fn decode_date(&self, cell: &Cell) -> Option<NaiveDate> {
        match cell {
            Cell::Date(d) => Some(*d),
            Cell::Number(n) => decode_yyyymmdd(*n).or_else(|| self.date_mode.decode_serial(*n)),
            Cell::Text(s) => decode_text_date(s),
            _ => None,
        }
    }
}

#[test]
fn test_decode_serial_1900() {
    let mode = DateMode::Excel1900;

    assert_eq!(mode.decode_serial(1.0), NaiveDate::from_ymd_opt(1900, 1, 1));
    assert_eq!(mode.decode_serial(59.0), NaiveDate::from_ymd_opt(1900, 2, 28));
    // serial 61 lands past the phantom leap day
    assert_eq!(mode.decode_serial(61.0), NaiveDate::from_ymd_opt(1900, 3, 1));
    assert_eq!(mode.decode_serial(45299.0), NaiveDate::from_ymd_opt(2024, 1, 8));

    assert_eq!(mode.decode_serial(0.0), None);
    assert_eq!(mode.decode_serial(20240105.0), None); // out of serial range
}

#[test]
fn test_decode_serial_1904() {
    let mode = DateMode::Excel1904;

    assert_eq!(mode.decode_serial(0.0), NaiveDate::from_ymd_opt(1904, 1, 1));
    assert_eq!(mode.decode_serial(366.0), NaiveDate::from_ymd_opt(1905, 1, 1));
}

#[test]
fn test_decode_serial_deterministic() {
    let mode = DateMode::Excel1900;
    assert_eq!(mode.decode_serial(45299.9), mode.decode_serial(45299.1));
    assert_eq!(mode.decode_serial(45299.0), mode.decode_serial(45299.0));
}

#[test]
fn test_decode_date_forms() {
    let grid = SheetGrid {
        rows: Vec::new(),
        date_mode: DateMode::Excel1900,
    };

    let expected = NaiveDate::from_ymd_opt(2024, 1, 5);
    assert_eq!(grid.decode_date(&Cell::Number(20240105.0)), expected);
    assert_eq!(grid.decode_date(&Cell::Text("2024-01-05".to_owned())), expected);
    assert_eq!(grid.decode_date(&Cell::Text("1/5/2024".to_owned())), expected);
    assert_eq!(grid.decode_date(&Cell::Date(expected.unwrap())), expected);

    assert_eq!(grid.decode_date(&Cell::Number(45299.0)), NaiveDate::from_ymd_opt(2024, 1, 8));

    assert_eq!(grid.decode_date(&Cell::Text("pending".to_owned())), None);
    assert_eq!(grid.decode_date(&Cell::Number(20241399.0)), None);
    assert_eq!(grid.decode_date(&Cell::Empty), None);
}

#[test]
fn test_load_grid_missing_file() {
    assert!(load_grid("no/such/file.xls", DateMode::Excel1900).is_err());
}
