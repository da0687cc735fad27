use crate::ActorId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Lowercase letters, digits and underscores; starts and ends with a letter or digit.
static HANDLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_]*[a-z0-9]$").expect("static handle pattern"));

const DOUBLE_UNDERSCORE: &str = "__";

/// Words that can never be claimed as a handle without `force_reserved`.
pub const DEFAULT_RESERVED_HANDLES: &[&str] = &[
    "admin",
    "system",
    "all",
    "new_handle",
    "handle",
    "burner",
    "burner_handle",
    "new_burner",
    "balance",
    "pay",
];

/// Errors raised when turning raw input into a [`HandleId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("handle id must not be empty")]
    EmptyHandle,
    #[error("unsanitized handle {0} (handle ids are lowercase only)")]
    NotLowercase(String),
}

/// Globally unique, lowercase handle identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(String);

impl HandleId {
    /// Parse an already-sanitized id. Uppercase input is a hard error.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        if raw.is_empty() {
            return Err(TypeError::EmptyHandle);
        }
        if raw.to_lowercase() != raw {
            return Err(TypeError::NotLowercase(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Lowercase and trim user input. The flag tells whether the input changed.
    pub fn normalize(raw: &str) -> Result<(Self, bool), TypeError> {
        let trimmed = raw.trim();
        let lowered = trimmed.to_lowercase();
        let changed = lowered != trimmed;
        Ok((Self::parse(&lowered)?, changed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type of a handle. Only `Regular`, `Burner`, `Npc` and `Burnt` are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleType {
    Regular,
    Burner,
    Npc,
    Reserved,
    Invalid,
    Unused,
    Burnt,
}

impl HandleType {
    /// Whether the type may be produced by a create request.
    pub fn is_creatable(self) -> bool {
        matches!(self, HandleType::Regular | HandleType::Burner | HandleType::Npc)
    }

    /// Whether a handle of this type is in use by an actor.
    pub fn is_live(self) -> bool {
        self.is_creatable()
    }
}

impl fmt::Display for HandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            HandleType::Regular => "regular",
            HandleType::Burner => "burner",
            HandleType::Npc => "npc",
            HandleType::Reserved => "reserved",
            HandleType::Invalid => "invalid",
            HandleType::Unused => "unused",
            HandleType::Burnt => "burnt",
        };
        f.write_str(value)
    }
}

/// A handle as seen by callers of the handle store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    pub handle_id: HandleId,
    /// `None` for unused, invalid and reserved names.
    pub actor_id: Option<ActorId>,
    pub handle_type: HandleType,
    pub is_active: bool,
}

impl Handle {
    /// A handle nobody owns, tagged with the reason.
    pub fn unowned(handle_id: HandleId, handle_type: HandleType) -> Self {
        Self {
            handle_id,
            actor_id: None,
            handle_type,
            is_active: false,
        }
    }

    pub fn exists(&self) -> bool {
        self.actor_id.is_some()
    }

    pub fn is_owned_by(&self, actor_id: &ActorId) -> bool {
        self.actor_id.as_ref() == Some(actor_id)
    }
}

/// Outcome of handle-name validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleValidity {
    Allowed,
    Invalid,
    Reserved,
}

/// Set of names that only privileged creation may claim.
#[derive(Debug, Clone)]
pub struct ReservedHandles {
    words: BTreeSet<String>,
}

impl ReservedHandles {
    pub fn empty() -> Self {
        Self {
            words: BTreeSet::new(),
        }
    }

    /// Add boot-time words supplied by game configuration. Input is lowercased.
    pub fn extend<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for word in words {
            let word = word.as_ref().trim().to_lowercase();
            if !word.is_empty() {
                self.words.insert(word);
            }
        }
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.words.contains(candidate)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Classify a candidate name.
    pub fn validate(&self, candidate: &str) -> HandleValidity {
        if !is_well_formed(candidate) {
            HandleValidity::Invalid
        } else if self.contains(candidate) {
            HandleValidity::Reserved
        } else {
            HandleValidity::Allowed
        }
    }
}

impl Default for ReservedHandles {
    fn default() -> Self {
        let mut reserved = Self::empty();
        reserved.extend(DEFAULT_RESERVED_HANDLES);
        reserved
    }
}

/// Syntactic handle rules, independent of the reserved set.
pub fn is_well_formed(candidate: &str) -> bool {
    HANDLE_PATTERN.is_match(candidate) && !candidate.contains(DOUBLE_UNDERSCORE)
}
