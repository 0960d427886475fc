//! SQLite backend: trigger-based change capture, the change-log reader and a
//! keyed target store.

mod capture;
mod changelog;
mod database;
mod error;
pub mod schema;
mod target;
pub mod value;

pub use capture::{CaptureInfo, SqliteCapture};
pub use changelog::SqliteChangeLog;
pub use database::{ColumnInfo, SqliteDatabase};
pub use error::{SqliteError, SqliteResult};
pub use target::{source_columns, SqliteTarget};
