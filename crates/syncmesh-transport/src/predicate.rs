//! Attribute-equality predicates for stream resolution
//!
//! A predicate is a conjunction of `key='value'` clauses:
//!
//! ```text
//! name='coordination' and session_id='lab-7'
//! ```

use std::fmt;
use std::str::FromStr;

use syncmesh_core::{SyncError, SyncResult};

use crate::StreamInfo;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Clause {
    key: String,
    value: String,
}

/// Conjunction of attribute equality clauses
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    /// The empty predicate matches every stream
    pub fn any() -> Self {
        Predicate::default()
    }

    /// Add a clause; fails if key or value cannot be expressed
    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> SyncResult<Self> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            return Err(SyncError::InvalidConfig(format!("invalid predicate key: {key:?}")));
        }
        if value.contains('\'') {
            return Err(SyncError::InvalidConfig(format!(
                "predicate value must not contain quotes: {value:?}"
            )));
        }
        self.clauses.push(Clause { key, value });
        Ok(self)
    }

    pub fn name(name: impl Into<String>) -> SyncResult<Self> {
        Predicate::any().and_eq("name", name)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Value required for `key`, if constrained
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.clauses
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }

    pub fn matches(&self, info: &StreamInfo) -> bool {
        self.clauses
            .iter()
            .all(|c| info.attribute(&c.key).as_deref() == Some(c.value.as_str()))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            write!(f, "{}='{}'", clause.key, clause.value)?;
        }
        Ok(())
    }
}

impl FromStr for Predicate {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Predicate::any());
        }
        let mut predicate = Predicate::any();
        for part in s.split(" and ") {
            let invalid = || SyncError::InvalidConfig(format!("invalid predicate clause: {part:?}"));
            let (key, quoted) = part.trim().split_once('=').ok_or_else(invalid)?;
            let value = quoted
                .trim()
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(invalid)?;
            predicate = predicate.and_eq(key.trim(), value)?;
        }
        Ok(predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmesh_core::DataType;

    fn info() -> StreamInfo {
        StreamInfo::new("coordination", "coordination", 1, 0.0, DataType::String, "n1")
            .with_session("lab-7")
    }

    #[test]
    fn test_matches_all_clauses() {
        let p = Predicate::name("coordination")
            .unwrap()
            .and_eq("session_id", "lab-7")
            .unwrap();
        assert!(p.matches(&info()));
        let other = Predicate::name("coordination")
            .unwrap()
            .and_eq("session_id", "lab-8")
            .unwrap();
        assert!(!other.matches(&info()));
        assert!(Predicate::any().matches(&info()));
    }

    #[test]
    fn test_parse_display_roundtrip() {
        let text = "name='coordination' and session_id='lab-7'";
        let p: Predicate = text.parse().unwrap();
        assert_eq!(p.to_string(), text);
        assert_eq!(p.value_of("session_id"), Some("lab-7"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("name=coordination".parse::<Predicate>().is_err());
        assert!("name".parse::<Predicate>().is_err());
        assert!("na me='x'".parse::<Predicate>().is_err());
        assert!(Predicate::name("it's").is_err());
    }
}
