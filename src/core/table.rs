// Validated table identifiers for generated SQL.
use crate::core::error::{Error, ErrorKind};

/// Name of the table being exported.
///
/// Only ASCII letters, digits, and underscores are accepted, and the name must
/// not start with a digit, so the quoted form never needs escaping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
        let valid_rest = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !valid_start || !valid_rest {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid table name: {name:?}"))
                .with_hint("Use letters, digits, and underscores (e.g. large_table)."));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}
