//! Core data model.
//!
//! A change is the smallest unit of work: what happened (the action) to which
//! resource (the key). Two changes with equal fields are the same work item as
//! far as the queue is concerned.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            _ => Err(format!("unknown action: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// An observed transition of one resource, identified by its cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Change {
    pub action: Action,
    pub key: String,
}

impl Change {
    pub fn new(action: Action, key: impl Into<String>) -> Self {
        Self {
            action,
            key: key.into(),
        }
    }

    pub fn create(key: impl Into<String>) -> Self {
        Self::new(Action::Create, key)
    }

    pub fn update(key: impl Into<String>) -> Self {
        Self::new(Action::Update, key)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(Action::Delete, key)
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.action, self.key)
    }
}
