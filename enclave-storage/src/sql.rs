//! Structured statements and the session-scoped connection trait.
//!
//! Statements are structured values rather than SQL text so the tenancy
//! enforcer can attach predicates to every statement shape without parsing.

use async_trait::async_trait;
use enclave_core::EnclaveResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A row as column name to JSON value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Row predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Eq {
        column: String,
        value: serde_json::Value,
    },
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Eq { column, value } => row.get(column) == Some(value),
        }
    }
}

/// A statement against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select {
        table: String,
        filter: Vec<Predicate>,
    },
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        filter: Vec<Predicate>,
        set: Row,
    },
    Delete {
        table: String,
        filter: Vec<Predicate>,
    },
}

impl Statement {
    pub fn select(table: impl Into<String>) -> Self {
        Statement::Select {
            table: table.into(),
            filter: Vec::new(),
        }
    }

    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Statement::Insert {
            table: table.into(),
            row,
        }
    }

    pub fn update(table: impl Into<String>, set: Row) -> Self {
        Statement::Update {
            table: table.into(),
            filter: Vec::new(),
            set,
        }
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Statement::Delete {
            table: table.into(),
            filter: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::Select { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Add a predicate. Inserts carry no filter and are returned unchanged.
    pub fn filtered(mut self, predicate: Predicate) -> Self {
        match &mut self {
            Statement::Select { filter, .. }
            | Statement::Update { filter, .. }
            | Statement::Delete { filter, .. } => filter.push(predicate),
            Statement::Insert { .. } => {}
        }
        self
    }
}

/// Rows returned and rows affected by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub affected: usize,
}

/// One database connection with per-session settings.
#[async_trait]
pub trait SqlConnection: Send {
    /// Equivalent of `SELECT set_config(name, value, false)`.
    async fn set_setting(&mut self, name: &str, value: &str) -> EnclaveResult<()>;

    async fn execute(&mut self, statement: &Statement) -> EnclaveResult<QueryResult>;

    async fn close(&mut self) -> EnclaveResult<()>;
}
