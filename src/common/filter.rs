//! Table inclusion filter
//!
//! Built from the configured set of {schema, table} pairs. The resulting
//! filter expression (`db\.table,db\.table`) is handed to the upstream
//! subscription; [`TableFilter::should_capture`] is the pipeline-side check.
//!
//! An empty pair set rejects everything unless match-all was explicitly
//! configured: fail safe, not fail open.

use crate::common::{CdcError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;

/// One captured database and its tables, as supplied by the external
/// config loader.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSpec {
    /// Schema (database) name
    pub schema: String,
    /// Tables to capture within the schema
    pub tables: Vec<String>,
}

impl DatabaseSpec {
    /// Convenience constructor.
    pub fn new(schema: impl Into<String>, tables: &[&str]) -> Self {
        Self {
            schema: schema.into(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Compiled inclusion filter over {schema, table} pairs.
#[derive(Debug, Clone)]
pub struct TableFilter {
    pairs: HashSet<(String, String)>,
    match_all: bool,
    expression: String,
    matcher: Option<Regex>,
}

impl TableFilter {
    /// Build from database specs. `match_all` must be set explicitly to
    /// treat an empty spec as "capture everything".
    pub fn from_specs(specs: &[DatabaseSpec], match_all: bool) -> Result<Self> {
        let mut pairs = HashSet::new();
        let mut expression = String::new();
        let mut alternatives = Vec::new();
        for spec in specs {
            if spec.schema.is_empty() {
                return Err(CdcError::config("database spec with empty schema name"));
            }
            for table in &spec.tables {
                if table.is_empty() {
                    return Err(CdcError::config(format!(
                        "empty table name under schema {}",
                        spec.schema
                    )));
                }
                if !expression.is_empty() {
                    expression.push(',');
                }
                expression.push_str(&spec.schema);
                expression.push_str("\\.");
                expression.push_str(table);
                alternatives.push(format!(
                    "{}\\.{}",
                    regex::escape(&spec.schema),
                    regex::escape(table)
                ));
                pairs.insert((spec.schema.clone(), table.clone()));
            }
        }
        if match_all {
            expression = ".*\\..*".to_string();
        }
        let matcher = if alternatives.is_empty() {
            None
        } else {
            let pattern = format!("^(?:{})$", alternatives.join("|"));
            Some(Regex::new(&pattern).map_err(|e| CdcError::config(e.to_string()))?)
        };
        Ok(Self {
            pairs,
            match_all,
            expression,
            matcher,
        })
    }

    /// Filter matching everything. Only reachable through explicit
    /// configuration.
    pub fn match_all() -> Self {
        Self {
            pairs: HashSet::new(),
            match_all: true,
            expression: ".*\\..*".to_string(),
            matcher: None,
        }
    }

    /// The subscription filter expression for the upstream stream.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the pipeline captures mutations of this table. An empty
    /// filter without explicit match-all captures nothing.
    pub fn should_capture(&self, schema: &str, table: &str) -> bool {
        if self.match_all {
            return true;
        }
        self.matcher
            .as_ref()
            .is_some_and(|m| m.is_match(&format!("{schema}.{table}")))
    }

    /// All configured pairs, for the metadata cache startup load.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    /// Number of configured pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when no pairs are configured.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
