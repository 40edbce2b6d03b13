use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{Client, Config, NoTls, Statement};

use crate::common::{RecordWriter, UpsertOutcome, WeeklyRecord};
use crate::error::PersistError;

pub fn expiry_columns(slots: usize) -> Vec<String> {
    (0..slots).map(|i| format!("expiry_{}", i)).collect()
}

fn qualified_table(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", schema, table),
        None => table.to_owned(),
    }
}

pub fn prepare_client(
    host: &str,
    port: u16,
    user: &str,
    dbname: &str,
    password: &str,
) -> Result<Client, PersistError> {
    let client = Config::new()
        .host(host)
        .port(port)
        .user(user)
        .dbname(dbname)
        .password(password)
        .connect(NoTls)?;

    Ok(client)
}

pub fn ensure_schema(client: &mut Client, schema: &str) -> Result<(), PersistError> {
    client.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))?;
    Ok(())
}

// warning: the column math in these builders must stay in step with the
// parameter layout assembled in upsert()
fn build_create_table_sql(schema: Option<&str>, table: &str, slots: usize) -> String {
    let mut sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {0} (
            ticker varchar(21) not null,
            name text,
            type text,
            list_date date not null,
    "#,
        qualified_table(schema, table)
    );

    for column in expiry_columns(slots) {
        sql.push_str(&format!("\t{} date,", column));
    }

    sql.push_str(&format!(
        "\n            constraint {}_pkeys primary key (ticker, list_date));",
        table
    ));
    sql
}

fn build_insert_sql(schema: Option<&str>, table: &str, slots: usize) -> String {
    let mut sql = format!(
        "INSERT INTO {} (ticker, name, type, list_date",
        qualified_table(schema, table)
    );
    for column in expiry_columns(slots) {
        sql.push_str(&format!(", {}", column));
    }

    sql.push_str(") VALUES(");
    for i in 1..=slots + 4 {
        sql.push_str(&format!("${},", i));
    }
    sql.pop(); // remove trailing comma
    sql.push_str(")");
    sql
}

fn build_update_sql(schema: Option<&str>, table: &str, slots: usize) -> String {
    let mut sql = format!(
        "UPDATE {} SET name = $2, type = $3",
        qualified_table(schema, table)
    );
    for (i, column) in expiry_columns(slots).iter().enumerate() {
        sql.push_str(&format!(", {} = ${}", column, i + 5));
    }

    sql.push_str(" WHERE ticker = $1 AND list_date = $4");
    sql
}

/// The weeklies table, with its upsert pair prepared once per run.
pub struct WeeklyTable {
    client: Client,
    insert: Statement,
    update: Statement,
}

impl WeeklyTable {
    /// Creates the schema and table when absent and prepares both halves
    /// of the upsert.
    pub fn open(
        mut client: Client,
        schema: Option<&str>,
        table: &str,
        slots: usize,
    ) -> Result<WeeklyTable, PersistError> {
        if let Some(schema) = schema {
            ensure_schema(&mut client, schema)?;
        }
        client.batch_execute(&build_create_table_sql(schema, table, slots))?;

        let insert = client.prepare(&build_insert_sql(schema, table, slots))?;
        let update = client.prepare(&build_update_sql(schema, table, slots))?;

        Ok(WeeklyTable {
            client,
            insert,
            update,
        })
    }
}

impl RecordWriter for WeeklyTable {
    /// Insert, falling back to an update of the existing row when the
    /// (ticker, list_date) key already exists. Both statements read from
    /// the same parameter layout. Any other database failure propagates.
    fn upsert(&mut self, record: &WeeklyRecord) -> Result<UpsertOutcome, PersistError> {
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        params.push(&record.ticker);
        params.push(&record.name);
        params.push(&record.product_type);
        params.push(&record.list_date);
        for expiry in &record.expirations {
            params.push(expiry);
        }

        match self.client.execute(&self.insert, &params[..]) {
            Ok(_) => Ok(UpsertOutcome::Inserted),
            Err(err) => {
                if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    self.client.execute(&self.update, &params[..])?;
                    Ok(UpsertOutcome::Updated)
                } else {
                    Err(PersistError::Database(err))
                }
            },
        }
    }
}

#[test]
fn test_build_create_table_sql() {
    let sql = build_create_table_sql(Some("listings"), "available_weeklies", 7);

    assert!(sql.contains("CREATE TABLE IF NOT EXISTS listings.available_weeklies"));
    assert!(sql.contains("expiry_0 date,"));
    assert!(sql.contains("expiry_6 date,"));
    assert!(!sql.contains("expiry_7"));
    assert!(sql.contains("constraint available_weeklies_pkeys primary key (ticker, list_date)"));
}

#[test]
fn test_build_insert_sql() {
    let sql = build_insert_sql(None, "available_weeklies", 2);

    assert_eq!(
        sql,
        "INSERT INTO available_weeklies (ticker, name, type, list_date, expiry_0, expiry_1) \
         VALUES($1,$2,$3,$4,$5,$6)"
    );
}

#[test]
fn test_build_update_sql() {
    let sql = build_update_sql(Some("listings"), "available_weeklies", 2);

    assert_eq!(
        sql,
        "UPDATE listings.available_weeklies SET name = $2, type = $3, \
         expiry_0 = $5, expiry_1 = $6 WHERE ticker = $1 AND list_date = $4"
    );
}
