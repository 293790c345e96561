//! Permanents tables: caller-supplied indirection replacing non-portable
//! objects (native functions, singletons, well-known tables) with arbitrary
//! persistable keys.
//!
//! The two directions are separate tables. The writer maps live objects to
//! keys by identity; the reader maps keys back to live objects with the same
//! equality the host's tables use (strings by content, numbers by value).

use std::collections::HashMap;

use crate::runtime::value::{ObjKey, TableKey, Value};

use super::{ErrorKind, PersistError};

/// Writer-direction permanents: live object → replacement key.
#[derive(Debug, Default)]
pub struct PermsOut {
    map: HashMap<ObjKey, Value>,
}

impl PermsOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `obj` to be written as `key`. Only reference values carry an
    /// identity to register under.
    pub fn insert(&mut self, obj: &Value, key: Value) -> Result<(), PersistError> {
        match obj.obj_key() {
            Some(k) => {
                self.map.insert(k, key);
                Ok(())
            }
            None => Err(ErrorKind::Unsupported(
                "only reference values can be permanents".to_string(),
            )
            .into()),
        }
    }

    pub(crate) fn lookup(&self, key: ObjKey) -> Option<&Value> {
        self.map.get(&key)
    }
}

/// Reader-direction permanents: replacement key → live object.
#[derive(Debug, Default)]
pub struct PermsIn {
    map: HashMap<TableKey, Value>,
}

impl PermsIn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Value, obj: Value) -> Result<(), PersistError> {
        let key = TableKey::try_new(key)
            .map_err(|_| ErrorKind::Unsupported("invalid permanent key".to_string()))?;
        self.map.insert(key, obj);
        Ok(())
    }

    pub(crate) fn lookup(&self, key: &Value) -> Option<&Value> {
        let key = TableKey::try_new(key.clone()).ok()?;
        self.map.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_keys_match_by_content() {
        let mut p = PermsIn::new();
        p.insert(Value::str("k"), Value::Number(7.0)).unwrap();
        // a different string allocation with the same bytes still resolves
        assert_eq!(p.lookup(&Value::str("k")), Some(&Value::Number(7.0)));
    }

    #[test]
    fn writer_keys_match_by_identity() {
        let mut p = PermsOut::new();
        let t = Value::table();
        p.insert(&t, Value::str("t")).unwrap();
        assert!(p.lookup(t.obj_key().unwrap()).is_some());
        let other = Value::table();
        assert!(p.lookup(other.obj_key().unwrap()).is_none());
    }

    #[test]
    fn trivial_values_cannot_be_permanents() {
        let mut p = PermsOut::new();
        assert!(p.insert(&Value::Number(1.0), Value::str("one")).is_err());
    }
}
