use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use regex::Regex;

use crate::common::{
    Cell, EventSink, IngestEvent, RecordWriter, SkipReason, UpsertOutcome, WeeklyRecord,
};
use crate::config::IngestConfig;
use crate::error::{IngestError, ParseError, PersistError, StructuralError};
use crate::sheet::SheetGrid;

const EMPTY_CELL: Cell = Cell::Empty;

/// One announcement batch: a contiguous slice of the grid beginning at a
/// start-marker row and running to the next marker or the end of sheet.
#[derive(Debug)]
pub struct Section<'a> {
    pub start_row: usize, // index of the marker row in the source grid
    pub rows: &'a [Vec<Cell>],
}

/// Weekly-type label (normalized) to the expiry dates announced for it,
/// in decoding order, duplicates retained.
pub type ExpiryMap = HashMap<String, Vec<NaiveDate>>;

/// A data row below the header, addressable through the header's
/// label-to-index map.
#[derive(Debug)]
pub struct DataRow<'a> {
    pub row: usize, // index in the source grid
    pub cells: &'a [Cell],
}

#[derive(Debug)]
pub struct ParsedSection<'a> {
    pub expiry_map: ExpiryMap,
    pub columns: HashMap<String, usize>,
    pub data_rows: Vec<DataRow<'a>>,
}

/// Lowercased with runs of whitespace collapsed, so "List  Date " and
/// "list date" land on the same key.
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<&str>>().join(" ").to_lowercase()
}

fn first_cell_text(row: &[Cell]) -> String {
    row.first().map(|c| c.as_string()).unwrap_or_default()
}

/// Partitions the grid into sections, one per start-marker row, in source
/// order. A sheet with no marker at all cannot be attributed and is fatal.
pub fn split_sections<'a>(
    grid: &'a SheetGrid,
    start_pattern: &Regex,
) -> Result<Vec<Section<'a>>, StructuralError> {
    let mut starts = Vec::new();
    for (number, row) in grid.rows.iter().enumerate() {
        if start_pattern.is_match(&first_cell_text(row)) {
            starts.push(number);
        }
    }

    if starts.is_empty() {
        return Err(StructuralError::NoSectionStart {
            pattern: start_pattern.as_str().to_owned(),
        });
    }

    let mut sections = Vec::new();
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or_else(|| grid.rows.len());
        sections.push(Section {
            start_row: start,
            rows: &grid.rows[start..end],
        });
    }

    Ok(sections)
}

/// Separates a section into its expiry block and its data rows.
///
/// The expiry block is every non-blank row strictly between the start
/// marker and the header row: first cell is the weekly-type label, the
/// remaining non-blank cells are expiry dates in sheet order. Data rows
/// follow the header; spacer rows with a blank first cell are dropped the
/// way the vendor intends them to be.
pub fn parse_section<'a>(
    grid: &SheetGrid,
    section: &Section<'a>,
    header_pattern: &Regex,
    sink: &mut dyn EventSink,
) -> Result<ParsedSection<'a>, StructuralError> {
    let mut header_offsets = Vec::new();
    for (offset, row) in section.rows.iter().enumerate().skip(1) {
        if header_pattern.is_match(&first_cell_text(row)) {
            header_offsets.push(offset);
        }
    }

    let header_offset = match header_offsets.len() {
        1 => header_offsets[0],
        0 => {
            return Err(StructuralError::NoHeaderRow {
                pattern: header_pattern.as_str().to_owned(),
                section_row: section.start_row,
            });
        },
        count => {
            return Err(StructuralError::AmbiguousHeaderRow {
                pattern: header_pattern.as_str().to_owned(),
                section_row: section.start_row,
                count,
            });
        },
    };

    let mut expiry_map: ExpiryMap = HashMap::new();
    for (offset, row) in section.rows.iter().enumerate().take(header_offset).skip(1) {
        if row.iter().all(Cell::is_blank) {
            continue;
        }

        let label = normalize_label(&first_cell_text(row));
        if label.is_empty() {
            continue;
        }

        let absolute = section.start_row + offset;
        let dates = expiry_map.entry(label).or_insert_with(Vec::new);
        for cell in row.iter().skip(1) {
            if cell.is_blank() {
                continue;
            }
            match grid.decode_date(cell) {
                Some(date) => {
                    dates.push(date);
                },
                None => {
                    sink.emit(IngestEvent::ExpiryCellSkipped {
                        row: absolute,
                        value: cell.as_string(),
                    });
                },
            }
        }
    }

    let mut columns = HashMap::new();
    for (idx, cell) in section.rows[header_offset].iter().enumerate() {
        let label = normalize_label(&cell.as_string());
        if label.is_empty() {
            continue;
        }
        columns.entry(label).or_insert(idx);
    }

    let mut data_rows = Vec::new();
    for (offset, row) in section.rows.iter().enumerate().skip(header_offset + 1) {
        let absolute = section.start_row + offset;

        if row.first().map(Cell::is_blank).unwrap_or(true) {
            if !row.iter().all(Cell::is_blank) {
                sink.emit(IngestEvent::RowSkipped {
                    row: absolute,
                    reason: SkipReason::BlankTicker,
                });
            }
            continue;
        }

        data_rows.push(DataRow {
            row: absolute,
            cells: row.as_slice(),
        });
    }

    Ok(ParsedSection {
        expiry_map,
        columns,
        data_rows,
    })
}

fn resolve_cell<'a>(
    data_row: &DataRow<'a>,
    columns: &HashMap<String, usize>,
    aliases: &HashMap<String, Vec<String>>,
    field: &str,
) -> Result<&'a Cell, ParseError> {
    if let Some(spellings) = aliases.get(field) {
        for spelling in spellings {
            if let Some(&idx) = columns.get(&normalize_label(spelling)) {
                return Ok(data_row.cells.get(idx).unwrap_or(&EMPTY_CELL));
            }
        }
    }

    Err(ParseError::MissingColumn {
        column: field.to_owned(),
    })
}

fn clean_text(raw: &str, marker: &str) -> String {
    let cleaned = if marker.is_empty() {
        raw.to_owned()
    } else {
        raw.replace(marker, "")
    };
    cleaned.trim().to_owned()
}

/// Turns one data row into a canonical record.
///
/// Ok(None) means the row carries no expiry information and must not be
/// written. Err means the row is malformed; the caller reports it and
/// moves on.
pub fn normalize_row(
    grid: &SheetGrid,
    data_row: &DataRow,
    columns: &HashMap<String, usize>,
    expiry_map: &ExpiryMap,
    config: &IngestConfig,
) -> Result<Option<WeeklyRecord>, ParseError> {
    let flag = config.flag_token.trim().to_lowercase();

    // union of the expiry lists for every marked weekly-type column
    let mut expiries: BTreeSet<NaiveDate> = BTreeSet::new();
    for (label, &idx) in columns {
        let dates = match expiry_map.get(label) {
            Some(d) => d,
            None => continue,
        };
        let value = match data_row.cells.get(idx) {
            Some(cell) => cell.as_string(),
            None => continue,
        };
        if value.trim().to_lowercase() == flag {
            expiries.extend(dates.iter().copied());
        }
    }

    if expiries.is_empty() {
        return Ok(None);
    }

    let marker = &config.strip_marker;
    let ticker = clean_text(
        &resolve_cell(data_row, columns, &config.aliases, "ticker")?.as_string(),
        marker,
    );
    let name = clean_text(
        &resolve_cell(data_row, columns, &config.aliases, "name")?.as_string(),
        marker,
    );
    let product_type = clean_text(
        &resolve_cell(data_row, columns, &config.aliases, "type")?.as_string(),
        marker,
    );

    let list_date_cell = resolve_cell(data_row, columns, &config.aliases, "list_date")?;
    let list_date = match grid.decode_date(list_date_cell) {
        Some(date) => date,
        None => {
            return Err(ParseError::BadListDate {
                value: list_date_cell.as_string(),
            });
        },
    };

    let mut expirations: Vec<Option<NaiveDate>> = expiries.into_iter().map(Some).collect();
    expirations.truncate(config.expiry_slots);
    expirations.resize(config.expiry_slots, None);

    Ok(Some(WeeklyRecord {
        ticker,
        name,
        product_type,
        list_date,
        expirations,
    }))
}

#[derive(Debug)]
pub struct Extraction {
    pub records: Vec<WeeklyRecord>,
    pub failed_sections: usize,
}

/// Runs the whole normalization pipeline over a loaded grid. Structural
/// trouble inside one section is reported and charged to
/// `failed_sections`; the remaining sections still produce records.
pub fn extract_records(
    grid: &SheetGrid,
    config: &IngestConfig,
    sink: &mut dyn EventSink,
) -> Result<Extraction, IngestError> {
    let start_pattern = config.start_regex()?;
    let header_pattern = config.header_regex()?;

    let sections = split_sections(grid, &start_pattern)?;

    let mut records = Vec::new();
    let mut failed_sections = 0;
    for (index, section) in sections.iter().enumerate() {
        sink.emit(IngestEvent::SectionFound {
            index,
            first_row: section.start_row,
            row_count: section.rows.len(),
        });

        let parsed = match parse_section(grid, section, &header_pattern, sink) {
            Ok(parsed) => parsed,
            Err(e) => {
                failed_sections += 1;
                sink.emit(IngestEvent::SectionFailed {
                    index,
                    message: e.to_string(),
                });
                continue;
            },
        };

        for data_row in &parsed.data_rows {
            match normalize_row(grid, data_row, &parsed.columns, &parsed.expiry_map, config) {
                Ok(Some(record)) => {
                    records.push(record);
                },
                Ok(None) => {
                    sink.emit(IngestEvent::RowSkipped {
                        row: data_row.row,
                        reason: SkipReason::NoExpiries,
                    });
                },
                Err(e) => {
                    sink.emit(IngestEvent::RowFailed {
                        row: data_row.row,
                        message: e.to_string(),
                    });
                },
            }
        }
    }

    Ok(Extraction {
        records,
        failed_sections,
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// Writes records in source order. The first write failure aborts the
/// rest of the batch; rows already written stay put.
pub fn write_records(
    records: &[WeeklyRecord],
    writer: &mut dyn RecordWriter,
    sink: &mut dyn EventSink,
) -> Result<WriteCounts, PersistError> {
    let mut counts = WriteCounts::default();

    for record in records {
        let outcome = writer.upsert(record)?;
        match outcome {
            UpsertOutcome::Inserted => counts.inserted += 1,
            UpsertOutcome::Updated => counts.updated += 1,
        }
        sink.emit(IngestEvent::RecordWritten {
            ticker: record.ticker.clone(),
            list_date: record.list_date,
            outcome,
        });
    }

    Ok(counts)
}

#[cfg(test)]
use crate::common::DateMode;

#[cfg(test)]
fn t(s: &str) -> Cell {
    Cell::Text(s.to_owned())
}

#[cfg(test)]
fn n(v: f64) -> Cell {
    Cell::Number(v)
}

#[cfg(test)]
fn d(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

// One section, one data row: the published layout in miniature.
// Serial 45299 is 2024-01-08, serial 45301 is 2024-01-10.
#[cfg(test)]
fn sample_grid() -> SheetGrid {
    SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Mon"), n(45299.0)],
            vec![t("Wed"), n(45301.0)],
            vec![t("Ticker Symbol"), t("Name"), t("Type"), t("List Date"), t("Mon"), t("Wed")],
            vec![t("ABC*"), t("Example Corp*"), t("Equity*"), n(20240105.0), t("x"), t("")],
        ],
        date_mode: DateMode::Excel1900,
    }
}

#[cfg(test)]
struct MemoryWriter {
    rows: HashMap<(String, NaiveDate), WeeklyRecord>,
}

#[cfg(test)]
impl MemoryWriter {
    fn new() -> MemoryWriter {
        MemoryWriter {
            rows: HashMap::new(),
        }
    }
}

#[cfg(test)]
impl RecordWriter for MemoryWriter {
    fn upsert(&mut self, record: &WeeklyRecord) -> Result<UpsertOutcome, PersistError> {
        let key = (record.ticker.clone(), record.list_date);
        match self.rows.insert(key, record.clone()) {
            Some(_) => Ok(UpsertOutcome::Updated),
            None => Ok(UpsertOutcome::Inserted),
        }
    }
}

#[test]
fn test_split_sections_counts_and_order() {
    let config = IngestConfig::default();
    let pattern = config.start_regex().unwrap();

    let grid = SheetGrid {
        rows: vec![
            vec![t("some preamble the vendor includes")],
            vec![t("List of Available Weekly Options")],
            vec![t("Mon"), n(45299.0)],
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Wed"), n(45301.0)],
            vec![t("trailer")],
        ],
        date_mode: DateMode::Excel1900,
    };

    let sections = split_sections(&grid, &pattern).unwrap();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].start_row, 1);
    assert_eq!(sections[0].rows.len(), 2);
    assert_eq!(sections[1].start_row, 3);
    assert_eq!(sections[1].rows.len(), 3);

    // concatenating the sections reconstructs the grid from the first marker on
    let rebuilt: Vec<&Vec<Cell>> = sections.iter().flat_map(|s| s.rows.iter()).collect();
    let original: Vec<&Vec<Cell>> = grid.rows[1..].iter().collect();
    assert_eq!(rebuilt, original);
}

#[test]
fn test_split_sections_requires_marker() {
    let config = IngestConfig::default();
    let pattern = config.start_regex().unwrap();

    let grid = SheetGrid {
        rows: vec![vec![t("Ticker Symbol")], vec![t("ABC")]],
        date_mode: DateMode::Excel1900,
    };

    match split_sections(&grid, &pattern) {
        Err(StructuralError::NoSectionStart { .. }) => {},
        other => panic!("expected NoSectionStart, got {:?}", other),
    }
}

#[test]
fn test_parse_section_builds_expiry_map() {
    let config = IngestConfig::default();
    let grid = sample_grid();
    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();

    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    assert_eq!(parsed.expiry_map["mon"], vec![d(2024, 1, 8)]);
    assert_eq!(parsed.expiry_map["wed"], vec![d(2024, 1, 10)]);
    assert_eq!(parsed.columns["ticker symbol"], 0);
    assert_eq!(parsed.columns["list date"], 3);
    assert_eq!(parsed.data_rows.len(), 1);
    assert_eq!(parsed.data_rows[0].row, 4);
}

#[test]
fn test_parse_section_header_required_and_unique() {
    let config = IngestConfig::default();
    let header = config.header_regex().unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();

    let headerless = SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Mon"), n(45299.0)],
        ],
        date_mode: DateMode::Excel1900,
    };
    let sections = split_sections(&headerless, &config.start_regex().unwrap()).unwrap();
    match parse_section(&headerless, &sections[0], &header, &mut events) {
        Err(StructuralError::NoHeaderRow { .. }) => {},
        other => panic!("expected NoHeaderRow, got {:?}", other),
    }

    let doubled = SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Ticker Symbol")],
            vec![t("Ticker Symbol")],
        ],
        date_mode: DateMode::Excel1900,
    };
    let sections = split_sections(&doubled, &config.start_regex().unwrap()).unwrap();
    match parse_section(&doubled, &sections[0], &header, &mut events) {
        Err(StructuralError::AmbiguousHeaderRow { count: 2, .. }) => {},
        other => panic!("expected AmbiguousHeaderRow, got {:?}", other),
    }
}

#[test]
fn test_parse_section_reports_undecodable_expiry_cells() {
    let config = IngestConfig::default();
    let grid = SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Mon"), n(45299.0), t("tbd")],
            vec![t("Ticker Symbol")],
        ],
        date_mode: DateMode::Excel1900,
    };
    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();

    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    assert_eq!(parsed.expiry_map["mon"], vec![d(2024, 1, 8)]);
    assert_eq!(
        events,
        vec![IngestEvent::ExpiryCellSkipped {
            row: 1,
            value: "tbd".to_owned()
        }]
    );
}

#[test]
fn test_normalize_row_example() {
    let config = IngestConfig::default();
    let grid = sample_grid();
    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();
    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    let record = normalize_row(&grid, &parsed.data_rows[0], &parsed.columns, &parsed.expiry_map, &config)
        .unwrap()
        .unwrap();

    assert_eq!(record.ticker, "ABC");
    assert_eq!(record.name, "Example Corp");
    assert_eq!(record.product_type, "Equity");
    assert_eq!(record.list_date, d(2024, 1, 5));
    assert_eq!(record.expirations.len(), 7);
    assert_eq!(record.expirations[0], Some(d(2024, 1, 8)));
    assert!(record.expirations[1..].iter().all(Option::is_none));
}

#[test]
fn test_normalize_row_skips_unflagged() {
    let config = IngestConfig::default();
    let mut grid = sample_grid();
    grid.rows[4][4] = t(""); // clear the Mon flag

    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();
    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    let result = normalize_row(&grid, &parsed.data_rows[0], &parsed.columns, &parsed.expiry_map, &config).unwrap();
    assert!(result.is_none());
}

#[test]
fn test_normalize_row_bad_list_date() {
    let config = IngestConfig::default();
    let mut grid = sample_grid();
    grid.rows[4][3] = t("pending");

    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();
    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    match normalize_row(&grid, &parsed.data_rows[0], &parsed.columns, &parsed.expiry_map, &config) {
        Err(ParseError::BadListDate { value }) => assert_eq!(value, "pending"),
        other => panic!("expected BadListDate, got {:?}", other),
    }
}

#[test]
fn test_normalize_row_dedups_and_sorts() {
    let config = IngestConfig::default();
    let grid = SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            // Wed repeats a Mon date; Mon's own list is out of order
            vec![t("Mon"), n(45301.0), n(45299.0)],
            vec![t("Wed"), n(45301.0), n(45303.0)],
            vec![t("Ticker Symbol"), t("Name"), t("Type"), t("List Date"), t("Mon"), t("Wed")],
            vec![t("ABC"), t("Example Corp"), t("Equity"), n(20240105.0), t("X "), t("x")],
        ],
        date_mode: DateMode::Excel1900,
    };

    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();
    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    let record = normalize_row(&grid, &parsed.data_rows[0], &parsed.columns, &parsed.expiry_map, &config)
        .unwrap()
        .unwrap();

    let dates: Vec<NaiveDate> = record.expirations.iter().filter_map(|e| *e).collect();
    assert_eq!(dates, vec![d(2024, 1, 8), d(2024, 1, 10), d(2024, 1, 12)]);
}

#[test]
fn test_normalize_row_truncates_to_slots() {
    let mut config = IngestConfig::default();
    config.expiry_slots = 2;

    let grid = SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Mon"), n(45299.0), n(45301.0), n(45303.0)],
            vec![t("Ticker Symbol"), t("Name"), t("Type"), t("List Date"), t("Mon")],
            vec![t("ABC"), t("Example Corp"), t("Equity"), n(20240105.0), t("x")],
        ],
        date_mode: DateMode::Excel1900,
    };

    let sections = split_sections(&grid, &config.start_regex().unwrap()).unwrap();
    let mut events: Vec<IngestEvent> = Vec::new();
    let parsed = parse_section(&grid, &sections[0], &config.header_regex().unwrap(), &mut events).unwrap();

    let record = normalize_row(&grid, &parsed.data_rows[0], &parsed.columns, &parsed.expiry_map, &config)
        .unwrap()
        .unwrap();

    assert_eq!(record.expirations, vec![Some(d(2024, 1, 8)), Some(d(2024, 1, 10))]);
}

#[test]
fn test_extract_records_absorbs_row_failures() {
    let config = IngestConfig::default();
    let grid = SheetGrid {
        rows: vec![
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Mon"), n(45299.0)],
            vec![t("Ticker Symbol"), t("Name"), t("Type"), t("List Date"), t("Mon")],
            vec![t("BAD"), t("Bad Corp"), t("Equity"), t("pending"), t("x")],
            vec![t("ABC"), t("Example Corp"), t("Equity"), n(20240105.0), t("x")],
            vec![Cell::Empty, t("orphaned note")],
        ],
        date_mode: DateMode::Excel1900,
    };

    let mut events: Vec<IngestEvent> = Vec::new();
    let extraction = extract_records(&grid, &config, &mut events).unwrap();

    assert_eq!(extraction.records.len(), 1);
    assert_eq!(extraction.records[0].ticker, "ABC");
    assert_eq!(extraction.failed_sections, 0);

    assert!(events.iter().any(|e| matches!(e, IngestEvent::RowFailed { row: 3, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        IngestEvent::RowSkipped {
            row: 5,
            reason: SkipReason::BlankTicker
        }
    )));
}

#[test]
fn test_extract_records_continues_past_bad_section() {
    let config = IngestConfig::default();
    let grid = SheetGrid {
        rows: vec![
            // first section has no header row at all
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Mon"), n(45299.0)],
            // second section is fine
            vec![t("LIST OF AVAILABLE WEEKLYS OPTIONS")],
            vec![t("Wed"), n(45301.0)],
            vec![t("Ticker Symbol"), t("Name"), t("Type"), t("List Date"), t("Wed")],
            vec![t("DEF"), t("Other Corp"), t("ETF"), n(20240105.0), t("x")],
        ],
        date_mode: DateMode::Excel1900,
    };

    let mut events: Vec<IngestEvent> = Vec::new();
    let extraction = extract_records(&grid, &config, &mut events).unwrap();

    assert_eq!(extraction.failed_sections, 1);
    assert_eq!(extraction.records.len(), 1);
    assert_eq!(extraction.records[0].ticker, "DEF");
    assert!(events.iter().any(|e| matches!(e, IngestEvent::SectionFailed { index: 0, .. })));
}

#[test]
fn test_extract_records_fatal_without_sections() {
    let config = IngestConfig::default();
    let grid = SheetGrid {
        rows: vec![vec![t("nothing to see here")]],
        date_mode: DateMode::Excel1900,
    };

    let mut events: Vec<IngestEvent> = Vec::new();
    match extract_records(&grid, &config, &mut events) {
        Err(IngestError::Structure(StructuralError::NoSectionStart { .. })) => {},
        other => panic!("expected NoSectionStart, got {:?}", other),
    }
    assert!(events.is_empty());
}

#[test]
fn test_ingest_is_idempotent() {
    let config = IngestConfig::default();
    let grid = sample_grid();
    let mut writer = MemoryWriter::new();

    let mut events: Vec<IngestEvent> = Vec::new();
    let extraction = extract_records(&grid, &config, &mut events).unwrap();
    let counts = write_records(&extraction.records, &mut writer, &mut events).unwrap();
    assert_eq!(counts, WriteCounts { inserted: 1, updated: 0 });

    // same sheet again: one persisted row, reported as updated, same values
    let mut events: Vec<IngestEvent> = Vec::new();
    let extraction = extract_records(&grid, &config, &mut events).unwrap();
    let counts = write_records(&extraction.records, &mut writer, &mut events).unwrap();
    assert_eq!(counts, WriteCounts { inserted: 0, updated: 1 });
    assert_eq!(writer.rows.len(), 1);

    let key = ("ABC".to_owned(), d(2024, 1, 5));
    assert_eq!(writer.rows[&key].expirations[0], Some(d(2024, 1, 8)));
    assert!(events.iter().any(|e| matches!(
        e,
        IngestEvent::RecordWritten {
            outcome: UpsertOutcome::Updated,
            ..
        }
    )));
}

#[test]
fn test_reingest_with_more_flags_replaces_row() {
    let config = IngestConfig::default();
    let mut writer = MemoryWriter::new();
    let mut events: Vec<IngestEvent> = Vec::new();

    let first = sample_grid();
    let extraction = extract_records(&first, &config, &mut events).unwrap();
    write_records(&extraction.records, &mut writer, &mut events).unwrap();

    // revised sheet marks Wed as well
    let mut second = sample_grid();
    second.rows[4][5] = t("x");
    let extraction = extract_records(&second, &config, &mut events).unwrap();
    let counts = write_records(&extraction.records, &mut writer, &mut events).unwrap();
    assert_eq!(counts, WriteCounts { inserted: 0, updated: 1 });

    let key = ("ABC".to_owned(), d(2024, 1, 5));
    let stored = &writer.rows[&key];
    assert_eq!(stored.expirations[0], Some(d(2024, 1, 8)));
    assert_eq!(stored.expirations[1], Some(d(2024, 1, 10)));
}
