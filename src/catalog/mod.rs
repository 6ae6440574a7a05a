#![forbid(unsafe_code)]

//! Boundary to the schema catalog.
//!
//! Graphs never persist catalog objects by identity. Procedures and statements are
//! written as opaque string keys and resolved back through a [`ProcedureCatalog`]
//! when an artifact is loaded.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::types::{MarkovError, ProcedureId, Result, StatementId};

/// Bidirectional lookup between catalog keys and procedure/statement identities.
pub trait ProcedureCatalog: Send + Sync {
    /// Returns the stable key for a procedure.
    fn procedure_key(&self, procedure: ProcedureId) -> Option<&str>;

    /// Resolves a procedure key written by [`ProcedureCatalog::procedure_key`].
    fn resolve_procedure(&self, key: &str) -> Option<ProcedureId>;

    /// Returns the stable key for a statement of a procedure.
    fn statement_key(&self, procedure: ProcedureId, statement: StatementId) -> Option<&str>;

    /// Resolves a statement key within the given procedure.
    fn resolve_statement(&self, procedure: ProcedureId, key: &str) -> Option<StatementId>;
}

#[derive(Debug, Clone)]
struct ProcedureEntry {
    key: String,
    statements: Vec<String>,
    statement_ids: HashMap<String, StatementId>,
}

/// In-memory schema catalog.
///
/// Procedure keys take the form `<database>.<procedure>`; statement keys are the
/// statement names. Ids are assigned in declaration order.
#[derive(Debug, Clone)]
pub struct Schema {
    database: String,
    procedures: Vec<ProcedureEntry>,
    by_key: HashMap<String, ProcedureId>,
}

#[derive(Deserialize)]
struct SchemaFile {
    database: String,
    #[serde(default)]
    procedures: Vec<ProcedureFile>,
}

#[derive(Deserialize)]
struct ProcedureFile {
    name: String,
    #[serde(default)]
    statements: Vec<String>,
}

impl Schema {
    /// Creates an empty schema for the named database.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            procedures: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Adds a procedure with its ordered statements.
    pub fn procedure(mut self, name: &str, statements: &[&str]) -> Self {
        self.add_procedure(name, statements.iter().map(|s| s.to_string()));
        self
    }

    /// Adds a procedure and returns its id. Re-adding a name returns the existing id.
    pub fn add_procedure<I>(&mut self, name: &str, statements: I) -> ProcedureId
    where
        I: IntoIterator<Item = String>,
    {
        let key = format!("{}.{}", self.database, name);
        if let Some(id) = self.by_key.get(&key) {
            return *id;
        }
        let statements: Vec<String> = statements.into_iter().collect();
        let statement_ids = statements
            .iter()
            .enumerate()
            .map(|(idx, stmt)| (stmt.clone(), StatementId(idx as u32)))
            .collect();
        let id = ProcedureId(self.procedures.len() as u32);
        self.procedures.push(ProcedureEntry {
            key: key.clone(),
            statements,
            statement_ids,
        });
        self.by_key.insert(key, id);
        id
    }

    /// Parses a schema from TOML.
    ///
    /// ```toml
    /// database = "bank"
    ///
    /// [[procedures]]
    /// name = "Transfer"
    /// statements = ["ReadBalance", "WriteBalance"]
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let file: SchemaFile = toml::from_str(input)?;
        let mut schema = Schema::new(file.database);
        for proc_def in file.procedures {
            schema.add_procedure(&proc_def.name, proc_def.statements);
        }
        Ok(schema)
    }

    /// Reads a TOML schema from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Database name used as the key prefix.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Looks up a procedure by its bare name.
    pub fn procedure_id(&self, name: &str) -> Option<ProcedureId> {
        self.by_key.get(&format!("{}.{}", self.database, name)).copied()
    }

    /// Looks up a statement of a procedure by name.
    pub fn statement_id(&self, procedure: ProcedureId, name: &str) -> Option<StatementId> {
        self.resolve_statement(procedure, name)
    }

    /// Number of registered procedures.
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    /// Returns `true` if no procedures are registered.
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    fn entry(&self, procedure: ProcedureId) -> Option<&ProcedureEntry> {
        self.procedures.get(procedure.0 as usize)
    }

    /// Resolves a procedure key, failing with [`MarkovError::UnresolvedKey`].
    pub fn require_procedure(&self, key: &str) -> Result<ProcedureId> {
        self.resolve_procedure(key)
            .ok_or_else(|| MarkovError::unresolved("procedure", key))
    }
}

impl ProcedureCatalog for Schema {
    fn procedure_key(&self, procedure: ProcedureId) -> Option<&str> {
        self.entry(procedure).map(|entry| entry.key.as_str())
    }

    fn resolve_procedure(&self, key: &str) -> Option<ProcedureId> {
        self.by_key.get(key).copied()
    }

    fn statement_key(&self, procedure: ProcedureId, statement: StatementId) -> Option<&str> {
        self.entry(procedure)?
            .statements
            .get(statement.0 as usize)
            .map(String::as_str)
    }

    fn resolve_statement(&self, procedure: ProcedureId, key: &str) -> Option<StatementId> {
        self.entry(procedure)?.statement_ids.get(key).copied()
    }
}
