//! SQL templates for a relation's change log and capture triggers.
//!
//! Every identifier comes from a validated [`LogTableDescriptor`], so quoting
//! is only needed to keep reserved words usable as names.

use tributary_core::{LogTableDescriptor, Operation};

/// Registry of captured relations, one row per relation.
pub const REGISTRY_TABLE: &str = "__tributary_captures";

/// `json_object` takes two arguments per column and SQLite's default
/// function argument limit is 127.
pub const MAX_CAPTURED_COLUMNS: usize = 63;

/// Current time as RFC 3339 UTC with millisecond precision.
const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

pub fn create_registry() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            relation TEXT PRIMARY KEY,
            log_table TEXT NOT NULL,
            columns TEXT NOT NULL,
            primary_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            installed_at TEXT NOT NULL DEFAULT ({})
        )",
        quote(REGISTRY_TABLE),
        NOW
    )
}

/// Schema statements for one captured relation.
pub struct LogSchema<'a> {
    descriptor: &'a LogTableDescriptor,
}

impl<'a> LogSchema<'a> {
    pub fn new(descriptor: &'a LogTableDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn create_log_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
                record_id NOT NULL,
                old_data TEXT,
                new_data TEXT,
                changed_at TEXT NOT NULL DEFAULT ({}),
                delivered INTEGER NOT NULL DEFAULT 0,
                delivered_at TEXT
            )",
            quote(&self.descriptor.log_table()),
            NOW
        )
    }

    pub fn create_pending_index(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (delivered, sequence_id)",
            quote(&self.descriptor.pending_index()),
            quote(&self.descriptor.log_table())
        )
    }

    pub fn create_retry_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                sequence_id INTEGER PRIMARY KEY,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                retry_after TEXT,
                updated_at TEXT NOT NULL DEFAULT ({})
            )",
            quote(&self.descriptor.retry_table()),
            NOW
        )
    }

    pub fn create_dead_letter_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                sequence_id INTEGER PRIMARY KEY,
                attempts INTEGER NOT NULL,
                error_message TEXT NOT NULL,
                dead_lettered_at TEXT NOT NULL DEFAULT ({})
            )",
            quote(&self.descriptor.dead_letter_table()),
            NOW
        )
    }

    /// `json_object('a', NEW."a", ...)` over the declared columns.
    fn image(&self, row: &str) -> String {
        let pairs: Vec<String> = self
            .descriptor
            .columns()
            .iter()
            .map(|c| format!("'{}', {}.{}", c, row, quote(c)))
            .collect();
        format!("json_object({})", pairs.join(", "))
    }

    pub fn create_trigger(&self, op: Operation) -> String {
        let pk = quote(self.descriptor.primary_key());
        let (event, record_id, old_data, new_data) = match op {
            Operation::Insert => (
                "INSERT",
                format!("NEW.{}", pk),
                "NULL".to_string(),
                self.image("NEW"),
            ),
            Operation::Update => (
                "UPDATE",
                format!("NEW.{}", pk),
                self.image("OLD"),
                self.image("NEW"),
            ),
            Operation::Delete => (
                "DELETE",
                format!("OLD.{}", pk),
                self.image("OLD"),
                "NULL".to_string(),
            ),
        };

        format!(
            "CREATE TRIGGER {trigger}
            AFTER {event} ON {relation}
            BEGIN
                INSERT INTO {log} (operation, record_id, old_data, new_data)
                VALUES ('{op}', {record_id}, {old_data}, {new_data});
            END",
            trigger = quote(&self.descriptor.trigger_name(op)),
            event = event,
            relation = quote(self.descriptor.relation()),
            log = quote(&self.descriptor.log_table()),
            op = op.as_str(),
            record_id = record_id,
            old_data = old_data,
            new_data = new_data,
        )
    }

    pub fn drop_trigger(&self, op: Operation) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {}",
            quote(&self.descriptor.trigger_name(op))
        )
    }

    /// Everything `initialize` creates, in dependency order, with triggers
    /// dropped and re-created so the statements can be re-run.
    pub fn install_statements(&self) -> Vec<String> {
        let mut statements = vec![
            self.create_log_table(),
            self.create_pending_index(),
            self.create_retry_table(),
            self.create_dead_letter_table(),
        ];
        for op in Operation::ALL {
            statements.push(self.drop_trigger(op));
            statements.push(self.create_trigger(op));
        }
        statements
    }
}
