use std::process;

#[macro_use]
extern crate lazy_static;
extern crate toml;

use clap::{App, Arg, ArgMatches};
use log::{error, info, warn};
use rpassword::prompt_password_stdout;
use walkdir::{DirEntry, WalkDir};

mod common;
mod config;
mod db;
mod error;
mod sheet;
mod weekly;

use common::{EventSink, IngestEvent};
use error::IngestError;

fn command_usage<'a, 'b>() -> App<'a, 'b> {
    const DEFAULT_HOST: &str = "localhost";
    const DEFAULT_PORT: &str = "5432";
    const DEFAULT_USER: &str = "postgres";
    const DEFAULT_TABLE: &str = "available_weeklies";
    const DEFAULT_SLOTS: &str = "7";

    App::new("weeklys-ingest")
    .author("Matthew Scheffel <matt@dataheck.com>")
    .about("Stores the CBOE's available weekly options listings in PostgreSQL")
    .arg(
        Arg::with_name("filename")
            .takes_value(true)
            .required_unless("backfill")
            .help("The xls/xlsx spreadsheet of available weeklies to ingest")
    )
    .arg(
        Arg::with_name("backfill")
            .long("backfill")
            .takes_value(true)
            .help("Trigger parsing of all spreadsheets in a given directory containing historical weekly listings")
    )
    .arg(
        Arg::with_name("host")
            .short("h")
            .long("host")
            .takes_value(true)
            .default_value(DEFAULT_HOST)
            .help("The hostname of the PostgreSQL server to connect to.")
    )
    .arg(
        Arg::with_name("database")
            .short("b")
            .long("database")
            .takes_value(true)
            .help("The database to USE on the PostgreSQL server.")
    )
    .arg(
        Arg::with_name("port")
            .short("p")
            .long("port")
            .takes_value(true)
            .default_value(DEFAULT_PORT)
            .help("The port to connect to the PostgreSQL server on.")
    )
    .arg(
        Arg::with_name("user")
            .short("u")
            .long("user")
            .takes_value(true)
            .default_value(DEFAULT_USER)
            .help("The user to connect to the PostgreSQL server with.")
    )
    .arg(
        Arg::with_name("schema")
            .short("s")
            .long("schema")
            .takes_value(true)
            .help("An optional database schema to group the table under; created if absent.")
    )
    .arg(
        Arg::with_name("tablename")
            .short("t")
            .long("tablename")
            .takes_value(true)
            .default_value(DEFAULT_TABLE)
            .help("The name of the table in which to store the data.")
    )
    .arg(
        Arg::with_name("expiry-slots")
            .long("expiry-slots")
            .takes_value(true)
            .default_value(DEFAULT_SLOTS)
            .help("How many expiry date columns the table carries.")
    )
    .arg(
        Arg::with_name("ingest-config")
            .long("ingest-config")
            .takes_value(true)
            .default_value("config/ingest.toml")
            .help("Location of sheet layout configuration (patterns, aliases, date mode)")
    )
    .arg(
        Arg::with_name("secret-config")
            .long("secret-config")
            .takes_value(true)
            .default_value("config/secret.toml")
            .help("Location of private configuration (passwords, database names)")
    )
}

/// Forwards pipeline events to the error stream, one line each.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: IngestEvent) {
        match event {
            IngestEvent::SectionFound { index, first_row, row_count } => {
                info!("Section {} starts at row {} ({} rows).", index, first_row + 1, row_count);
            },
            IngestEvent::SectionFailed { index, message } => {
                warn!("Section {} skipped: {}", index, message);
            },
            IngestEvent::ExpiryCellSkipped { row, value } => {
                warn!("Row {}: ignoring undecodable expiry cell '{}'.", row + 1, value);
            },
            IngestEvent::RowSkipped { row, reason } => {
                info!("Row {}: skipped ({}).", row + 1, reason);
            },
            IngestEvent::RowFailed { row, message } => {
                warn!("Row {}: {}", row + 1, message);
            },
            IngestEvent::RecordWritten { ticker, list_date, outcome } => {
                info!("{} {}: {}.", ticker, list_date, outcome);
            },
        }
    }
}

fn spreadsheet_filter(entry: &DirEntry) -> bool {
    let is_folder = entry.file_type().is_dir();
    let file_name = entry.file_name().to_str().unwrap();
    let lowercase_file_name = file_name.to_lowercase();
    let file_ext = lowercase_file_name.split('.').last();

    match file_ext {
        Some(ext) => ext == "xls" || ext == "xlsx" || is_folder,
        None => false,
    }
}

fn collect_spreadsheets(target_path: &str) -> Vec<String> {
    let mut file_queue = Vec::new();
    for entry in WalkDir::new(target_path).into_iter().filter_entry(|e| spreadsheet_filter(e)) {
        match entry {
            Ok(e) => {
                if e.file_type().is_file() {
                    file_queue.push(String::from(e.path().to_str().unwrap()))
                } else {
                    continue; // no message required for skipping folders
                }
            },
            Err(e) => {
                warn!("Forced to skip entry: {}", e); // file system error?
                continue;
            },
        };
    }

    file_queue
}

fn run(matches: &ArgMatches) -> Result<(), IngestError> {
    let mut ingest_config = config::load_ingest_config(matches.value_of("ingest-config").unwrap())?;
    if matches.occurrences_of("expiry-slots") > 0 {
        let raw = matches.value_of("expiry-slots").unwrap();
        ingest_config.expiry_slots = raw
            .parse::<usize>()
            .expect(&format!("Invalid expiry slot count specified: '{}'", raw));
    }

    // surface pattern mistakes once, before touching any file
    ingest_config.start_regex()?;
    ingest_config.header_regex()?;

    let secret_config = config::load_secret_config(matches.value_of("secret-config").unwrap());

    let dbname = {
        match secret_config.as_ref() {
            Some(c) if c.contains_key("postgres") && c["postgres"].contains_key("dbname") => {
                String::from(&c["postgres"]["dbname"])
            },
            _ => {
                match matches.value_of("database") {
                    Some(database) => database.to_string(),
                    None => panic!("Must specify postgres dbname either by command line argument or via secret config"),
                }
            },
        }
    };

    let host = matches.value_of("host").unwrap();
    let user = matches.value_of("user").unwrap();
    let port = matches
        .value_of("port")
        .unwrap()
        .parse::<u16>()
        .expect(&format!("Invalid port specified: '{}.'", matches.value_of("port").unwrap()));
    let schema = matches.value_of("schema");
    let tablename = matches.value_of("tablename").unwrap();

    let password = {
        match secret_config.as_ref() {
            Some(c) if c.contains_key("postgres") && c["postgres"].contains_key("password") => {
                String::from(&c["postgres"]["password"])
            },
            _ => prompt_password_stdout("Password: ").unwrap(),
        }
    };

    let mut sink = LogSink;

    if let Some(target_path) = matches.value_of("backfill") {
        info!("Connecting to PostgreSQL {}:{} as user '{}'.", host, port, user);
        let client = db::prepare_client(host, port, user, &dbname, &password)?;
        let mut table = db::WeeklyTable::open(client, schema, tablename, ingest_config.expiry_slots)?;

        let mut failed_sections = 0;
        for path in collect_spreadsheets(target_path) {
            let grid = match sheet::load_grid(&path, ingest_config.date_mode) {
                Ok(grid) => grid,
                Err(e) => {
                    warn!("Failed to process file {}: {}", path, e);
                    continue;
                },
            };

            let extraction = match weekly::extract_records(&grid, &ingest_config, &mut sink) {
                Ok(extraction) => extraction,
                Err(e) => {
                    warn!("Failed to process file {}: {}", path, e);
                    continue;
                },
            };
            failed_sections += extraction.failed_sections;

            // a write failure is still fatal; parse trouble is per-file
            let counts = weekly::write_records(&extraction.records, &mut table, &mut sink)?;
            info!("{}: {} inserted, {} updated.", path, counts.inserted, counts.updated);
        }

        if failed_sections > 0 {
            return Err(IngestError::SectionFailures { count: failed_sections });
        }
    } else {
        let filename = matches.value_of("filename").unwrap();

        // the whole sheet is parsed before any database connection is made
        let grid = sheet::load_grid(filename, ingest_config.date_mode)?;
        let extraction = weekly::extract_records(&grid, &ingest_config, &mut sink)?;
        info!("Parsed {} records from {}.", extraction.records.len(), filename);

        info!("Connecting to PostgreSQL {}:{} as user '{}'.", host, port, user);
        let client = db::prepare_client(host, port, user, &dbname, &password)?;
        match schema {
            Some(schema) => info!("Preparing to write to table {}.{}.", schema, tablename),
            None => info!("Preparing to write to table {}.", tablename),
        }

        let mut table = db::WeeklyTable::open(client, schema, tablename, ingest_config.expiry_slots)?;
        let counts = weekly::write_records(&extraction.records, &mut table, &mut sink)?;
        info!("{} inserted, {} updated.", counts.inserted, counts.updated);

        if extraction.failed_sections > 0 {
            return Err(IngestError::SectionFailures { count: extraction.failed_sections });
        }
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = command_usage().get_matches();

    match run(&matches) {
        Ok(()) => {
            info!("Data written.");
        },
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        },
    }
}
