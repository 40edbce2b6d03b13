use thiserror::Error;

/// The source file could not be opened or read as a spreadsheet.
/// Always fatal, and always raised before any database write.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open workbook {path}: {source}")]
    Workbook {
        path: String,
        source: calamine::Error,
    },
    #[error("workbook {path} contains no worksheets")]
    NoWorksheet { path: String },
}

/// The sheet's section or header markers are missing or ambiguous, so
/// rows cannot be attributed to columns. Missing section starts kill the
/// run; header trouble kills the enclosing section.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("no section start matching \"{pattern}\" found")]
    NoSectionStart { pattern: String },
    #[error("no header row matching \"{pattern}\" in section starting at row {section_row}")]
    NoHeaderRow { pattern: String, section_row: usize },
    #[error("{count} header rows matching \"{pattern}\" in section starting at row {section_row}")]
    AmbiguousHeaderRow {
        pattern: String,
        section_row: usize,
        count: usize,
    },
}

/// A single row failed to decode. Absorbed with a diagnostic; the run
/// continues with the next row.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("bad list date \"{value}\"")]
    BadListDate { value: String },
    #[error("missing required column \"{column}\"")]
    MissingColumn { column: String },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),
}

/// Everything the run path can die of.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Structure(#[from] StructuralError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("invalid configuration {path}: {message}")]
    Config { path: String, message: String },
    #[error("{count} section(s) could not be processed")]
    SectionFailures { count: usize },
}
