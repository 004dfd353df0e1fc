//! The change envelope published on cache channels.
//!
//! ```json
//! {"table": "users", "action": "UPDATE", "data": {"id": "U1", "email": "new@x"}}
//! ```
//!
//! Actions are matched case-sensitively. Anything other than `INSERT`,
//! `UPDATE` or `DELETE` decodes to [`ChangeAction::Unknown`] so that new
//! trigger actions do not break older consumers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Row-level change kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeAction {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
    /// Unrecognized action, kept verbatim.
    Unknown(String),
}

impl From<String> for ChangeAction {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<ChangeAction> for String {
    fn from(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Insert => "INSERT".into(),
            ChangeAction::Update => "UPDATE".into(),
            ChangeAction::Delete => "DELETE".into(),
            ChangeAction::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("INSERT"),
            Self::Update => f.write_str("UPDATE"),
            Self::Delete => f.write_str("DELETE"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// One row change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope<T> {
    /// Source table. Optional on the wire.
    #[serde(default)]
    pub table: String,
    /// What happened to the row.
    pub action: ChangeAction,
    /// The row after an insert or update; at least its key on delete.
    pub data: T,
}
