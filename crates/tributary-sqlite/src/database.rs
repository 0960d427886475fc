use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use tributary_core::{validate_identifier, RowMap};

use crate::error::{SqliteError, SqliteResult};
use crate::value::from_sql_value;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One column as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, empty when the column has none.
    pub decl_type: String,
    pub not_null: bool,
    /// 1-based position in the primary key, 0 when not part of it.
    pub pk: u32,
}

/// A shared handle to one SQLite database.
///
/// Clones share the same connection, so a change log, its capture installer
/// and a target living in the same file all see one transaction state.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> SqliteResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening database");

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> SqliteResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SqliteError::Poisoned)
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> SqliteResult<R>) -> SqliteResult<R> {
        let mut conn = self.lock()?;
        f(&mut conn)
    }

    /// Execute one or more statements with no parameters.
    pub fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    pub fn table_exists(&self, table: &str) -> SqliteResult<bool> {
        self.with_conn(|conn| table_exists(conn, table))
    }

    /// Columns of a table in declaration order.
    pub fn table_info(&self, table: &str) -> SqliteResult<Vec<ColumnInfo>> {
        self.with_conn(|conn| table_info(conn, table))
    }

    /// Every row of a table, ordered by `order_by`.
    pub fn select_rows(&self, table: &str, order_by: &str) -> SqliteResult<Vec<RowMap>> {
        validate_identifier(table)?;
        validate_identifier(order_by)?;

        self.with_conn(|conn| {
            let sql = format!("SELECT * FROM \"{}\" ORDER BY \"{}\"", table, order_by);
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

            let rows = stmt.query_map([], |row| {
                let mut image = RowMap::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    image.insert(name.clone(), from_sql_value(row.get_ref(i)?));
                }
                Ok(image)
            })?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    pub fn row_count(&self, table: &str) -> SqliteResult<u64> {
        validate_identifier(table)?;
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn trigger_exists(conn: &Connection, trigger: &str) -> SqliteResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
            [trigger],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn table_info(conn: &Connection, table: &str) -> SqliteResult<Vec<ColumnInfo>> {
    validate_identifier(table)?;

    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            not_null: row.get::<_, i64>(3)? != 0,
            pk: row.get::<_, i64>(5)? as u32,
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }

    if columns.is_empty() {
        return Err(SqliteError::NotFound(table.to_string()));
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::Value;

    #[test]
    fn test_table_info() {
        let db = SqliteDatabase::in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT NOT NULL, email TEXT)",
        )
        .unwrap();

        let info = db.table_info("users").unwrap();
        let names: Vec<_> = info.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "username", "email"]);
        assert_eq!(info[0].pk, 1);
        assert_eq!(info[0].decl_type, "INTEGER");
        assert!(info[1].not_null);

        assert!(db.table_exists("users").unwrap());
        assert!(!db.table_exists("missing").unwrap());
        assert!(matches!(
            db.table_info("missing"),
            Err(SqliteError::NotFound(_))
        ));
    }

    #[test]
    fn test_select_rows() {
        let db = SqliteDatabase::in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, score REAL);
             INSERT INTO items VALUES (2, 'b', 1.5), (1, 'a', NULL);",
        )
        .unwrap();

        let rows = db.select_rows("items", "id").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&Value::String("a".into())));
        assert_eq!(rows[0].get("score"), Some(&Value::Null));
        assert_eq!(rows[1].get("score"), Some(&Value::Float(1.5)));
        assert_eq!(db.row_count("items").unwrap(), 2);
    }

    #[test]
    fn test_select_rejects_bad_identifiers() {
        let db = SqliteDatabase::in_memory().unwrap();
        assert!(db.select_rows("items; DROP TABLE x", "id").is_err());
    }
}
