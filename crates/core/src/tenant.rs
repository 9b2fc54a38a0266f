//! Tenant schema configuration.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};
use crate::sessions::SESSION_TIMEOUT_MINUTES;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,126}$").expect("valid identifier regex"));

/// Whether `name` is a plain SQL identifier that needs no escaping.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

fn validate_schema_name(name: &str) -> std::result::Result<(), ValidationError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_schema_name"))
    }
}

fn validate_principals(principals: &BTreeSet<String>) -> std::result::Result<(), ValidationError> {
    match principals.iter().find(|p| !is_identifier(p)) {
        None => Ok(()),
        Some(bad) => {
            let mut err = ValidationError::new("invalid_principal");
            err.message = Some(format!("principal {:?} is not a plain identifier", bad).into());
            Err(err)
        }
    }
}

fn validate_properties(properties: &[String]) -> std::result::Result<(), ValidationError> {
    if properties.iter().any(|p| p.is_empty()) {
        let mut err = ValidationError::new("empty_property_pattern");
        err.message = Some("property patterns must be non-empty".into());
        return Err(err);
    }
    Ok(())
}

fn default_idle_threshold() -> i64 {
    SESSION_TIMEOUT_MINUTES
}

/// One tenant schema to materialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SchemaConfig {
    /// Schema holding `pages` and `tracks`, and receiving the outputs
    #[validate(custom(function = "validate_schema_name"))]
    pub name: String,
    /// Roles or users granted read access to the outputs
    #[serde(default, alias = "users")]
    #[validate(custom(function = "validate_principals"))]
    pub principals: BTreeSet<String>,
    /// Column-name substrings to propagate
    #[serde(default)]
    #[validate(custom(function = "validate_properties"))]
    pub properties: Vec<String>,
    /// Gap (minutes) after which a new session starts
    #[serde(default = "default_idle_threshold")]
    #[validate(range(min = 1))]
    pub idle_threshold_minutes: i64,
}

impl SchemaConfig {
    /// Creates a schema config with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            principals: BTreeSet::new(),
            properties: Vec::new(),
            idle_threshold_minutes: default_idle_threshold(),
        }
    }

    pub fn with_principals<I, S>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principals = principals.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Runs the derive validations and maps them to a config error.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("schema {:?}: {}", self.name, e)))
    }
}
