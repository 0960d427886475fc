use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::Operation;

/// Describes a captured source relation and the log objects derived from it.
///
/// Built once through [`DescriptorBuilder`], which validates every identifier
/// that later ends up in generated SQL. Immutable afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTableDescriptor {
    relation: String,
    columns: Vec<String>,
    primary_key: String,
}

impl LogTableDescriptor {
    /// Create a builder for constructing a descriptor.
    pub fn builder(relation: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(relation)
    }

    /// Descriptor whose primary key is the first declared column.
    pub fn new(relation: impl Into<String>, columns: Vec<String>) -> Result<Self> {
        Self::builder(relation).columns(columns).build()
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Declared columns, in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn log_table(&self) -> String {
        format!("{}_cdc", self.relation)
    }

    /// Index supporting the "undelivered, ascending sequence" scan.
    pub fn pending_index(&self) -> String {
        format!("idx_{}_pending", self.log_table())
    }

    pub fn retry_table(&self) -> String {
        format!("{}_retry", self.log_table())
    }

    pub fn dead_letter_table(&self) -> String {
        format!("{}_dlq", self.log_table())
    }

    pub fn trigger_name(&self, op: Operation) -> String {
        format!(
            "{}_{}_trigger",
            self.relation,
            op.as_str().to_ascii_lowercase()
        )
    }

    /// Stable hash of the relation, column list and key.
    ///
    /// Used to detect whether installed hooks still match this descriptor.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.relation.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.columns.join(",").as_bytes());
        hasher.update(b"\n");
        hasher.update(self.primary_key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Builder for [`LogTableDescriptor`].
pub struct DescriptorBuilder {
    relation: String,
    columns: Vec<String>,
    primary_key: Option<String>,
}

impl DescriptorBuilder {
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            columns: vec![],
            primary_key: None,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the primary-key column. Defaults to the first column.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn build(self) -> Result<LogTableDescriptor> {
        validate_identifier(&self.relation)?;

        if self.columns.is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "relation '{}' declares no columns",
                self.relation
            )));
        }

        for (i, column) in self.columns.iter().enumerate() {
            validate_identifier(column)?;
            if self.columns[..i].contains(column) {
                return Err(Error::InvalidDescriptor(format!(
                    "column '{}' declared twice",
                    column
                )));
            }
        }

        let primary_key = match self.primary_key {
            Some(pk) => {
                if pk.contains(',') {
                    return Err(Error::InvalidDescriptor(format!(
                        "composite primary key '{}' is not supported",
                        pk
                    )));
                }
                if !self.columns.contains(&pk) {
                    return Err(Error::MissingColumn(pk));
                }
                pk
            }
            None => self.columns[0].clone(),
        };

        Ok(LogTableDescriptor {
            relation: self.relation,
            columns: self.columns,
            primary_key,
        })
    }
}

/// Check that a name is a plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidDescriptor(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}
