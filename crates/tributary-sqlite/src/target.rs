use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use tributary_core::{validate_identifier, ApplyAction, Result, RowMap, TargetStore, Value};

use crate::database::{table_exists, ColumnInfo, SqliteDatabase};
use crate::error::{SqliteError, SqliteResult};
use crate::schema::quote;
use crate::value::to_sql_value;

const SAVEPOINT: &str = "tributary_apply";

/// Replicates change records into a table keyed by one column.
///
/// Writes accumulate in one transaction per batch, opened by the first
/// [`TargetStore::apply`] and closed by [`TargetStore::commit`]. Each action
/// runs under its own savepoint so a failing action leaves the rest of the
/// batch intact.
///
/// The key column must be the table's primary key or carry a unique
/// constraint, otherwise upserts cannot detect an existing row.
#[derive(Clone)]
pub struct SqliteTarget {
    db: SqliteDatabase,
    table: String,
    key_column: String,
}

impl SqliteTarget {
    /// Attach to an existing table.
    pub fn new(db: SqliteDatabase, table: &str, key_column: &str) -> SqliteResult<Self> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;

        let columns = db.table_info(table)?;
        if !columns.iter().any(|c| c.name == key_column) {
            return Err(SqliteError::NotFound(format!("{}.{}", table, key_column)));
        }

        Ok(Self {
            db,
            table: table.to_string(),
            key_column: key_column.to_string(),
        })
    }

    /// Create the table from a source table's columns when it is missing,
    /// then attach to it. Returns whether the table was created.
    pub fn create_like(
        db: SqliteDatabase,
        table: &str,
        key_column: &str,
        columns: &[ColumnInfo],
    ) -> SqliteResult<(Self, bool)> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;

        let created = db.with_conn(|conn| {
            if table_exists(conn, table)? {
                return Ok(false);
            }
            conn.execute_batch(&create_table_sql(table, key_column, columns)?)?;
            Ok(true)
        })?;

        if created {
            debug!(table, key_column, "Created target table");
        }
        Ok((Self::new(db, table, key_column)?, created))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn get(&self, key: &Value) -> SqliteResult<Option<RowMap>> {
        Ok(self
            .rows()?
            .into_iter()
            .find(|row| row.get(&self.key_column) == Some(key)))
    }

    pub fn rows(&self) -> SqliteResult<Vec<RowMap>> {
        self.db.select_rows(&self.table, &self.key_column)
    }

    pub fn row_count(&self) -> SqliteResult<u64> {
        self.db.row_count(&self.table)
    }

    fn upsert(&self, conn: &Connection, row: &RowMap) -> SqliteResult<()> {
        let mut columns: Vec<&String> = row.keys().collect();
        columns.sort();
        for column in &columns {
            validate_identifier(column)?;
        }

        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(&self.table),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );
        conn.execute(
            &sql,
            params_from_iter(columns.iter().map(|c| to_sql_value(&row[*c]))),
        )?;
        Ok(())
    }

    /// Set every non-key column from `row`. Falls back to an upsert when no
    /// row has the key, so replayed updates still converge.
    fn update(&self, conn: &Connection, key: &Value, row: &RowMap) -> SqliteResult<()> {
        let mut columns: Vec<&String> = row.keys().filter(|c| **c != self.key_column).collect();
        columns.sort();
        for column in &columns {
            validate_identifier(column)?;
        }

        let matched = if columns.is_empty() {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                    quote(&self.table),
                    quote(&self.key_column)
                ),
                [to_sql_value(key)],
                |r| r.get::<_, i64>(0),
            )? as usize
        } else {
            let assignments: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quote(&self.table),
                assignments.join(", "),
                quote(&self.key_column),
                columns.len() + 1
            );
            let values = columns
                .iter()
                .map(|c| to_sql_value(&row[*c]))
                .chain(std::iter::once(to_sql_value(key)));
            conn.execute(&sql, params_from_iter(values))?
        };

        if matched == 0 {
            debug!(table = %self.table, key = ?key, "Update matched no row, upserting");
            self.upsert(conn, row)?;
        }
        Ok(())
    }

    fn delete(&self, conn: &Connection, key: &Value) -> SqliteResult<()> {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote(&self.table),
                quote(&self.key_column)
            ),
            [to_sql_value(key)],
        )?;
        Ok(())
    }

    fn execute(&self, conn: &Connection, action: &ApplyAction) -> SqliteResult<()> {
        match action {
            ApplyAction::Upsert { row, .. } => self.upsert(conn, row),
            ApplyAction::Update { key, row } => self.update(conn, key, row),
            ApplyAction::Replace { old_key, row, .. } => {
                self.delete(conn, old_key)?;
                self.upsert(conn, row)
            }
            ApplyAction::Delete { key } => self.delete(conn, key),
        }
    }
}

impl TargetStore for SqliteTarget {
    fn apply(&self, action: &ApplyAction) -> Result<()> {
        self.db.with_conn(|conn| {
            if conn.is_autocommit() {
                conn.execute_batch("BEGIN")?;
            }
            conn.execute_batch(&format!("SAVEPOINT {}", SAVEPOINT))?;

            match self.execute(conn, action) {
                Ok(()) => {
                    conn.execute_batch(&format!("RELEASE {}", SAVEPOINT))?;
                    Ok(())
                }
                Err(e) => {
                    conn.execute_batch(&format!(
                        "ROLLBACK TO {sp}; RELEASE {sp}",
                        sp = SAVEPOINT
                    ))?;
                    Err(e)
                }
            }
        })?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            if !conn.is_autocommit() {
                warn!(table = %self.table, "Rolling back uncommitted target writes");
                conn.execute_batch("ROLLBACK")?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// `CREATE TABLE` mirroring the source columns, keyed on `key_column`.
fn create_table_sql(table: &str, key_column: &str, columns: &[ColumnInfo]) -> SqliteResult<String> {
    if !columns.iter().any(|c| c.name == key_column) {
        return Err(SqliteError::NotFound(format!("column {}", key_column)));
    }

    let definitions: Vec<String> = columns
        .iter()
        .map(|c| {
            validate_identifier(&c.name)?;
            let mut def = quote(&c.name);
            if !c.decl_type.is_empty() {
                def.push(' ');
                def.push_str(&c.decl_type);
            }
            if c.name == key_column {
                def.push_str(" PRIMARY KEY");
            }
            Ok(def)
        })
        .collect::<SqliteResult<_>>()?;

    Ok(format!(
        "CREATE TABLE {} ({})",
        quote(table),
        definitions.join(", ")
    ))
}

/// Columns of the source table that a target created with
/// [`SqliteTarget::create_like`] should carry.
pub fn source_columns(db: &SqliteDatabase, table: &str, keep: &[String]) -> SqliteResult<Vec<ColumnInfo>> {
    Ok(db
        .table_info(table)?
        .into_iter()
        .filter(|c| keep.contains(&c.name))
        .collect())
}
