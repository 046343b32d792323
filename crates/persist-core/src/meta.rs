//! MetaStore — the set of storage keys that hold persisted values.
//!
//! The set is stored as a single record `{"keys": Set[...]}` under the
//! reserved meta key, so a restore can find every persisted key with one
//! read.

use std::collections::{BTreeMap, BTreeSet};

use persist_codec::{Codec, Value};

use crate::error::{PersistError, PersistResult};

const KEYS_FIELD: &str = "keys";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaStore {
    keys: BTreeSet<String>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a stored meta record. Absent input yields an empty store.
    ///
    /// `keys` may be encoded as a set or as a plain array.
    pub fn load(raw: Option<&str>, codec: &dyn Codec) -> PersistResult<Self> {
        let Some(raw) = raw else {
            return Ok(Self::new());
        };
        let record = codec
            .decode(raw)
            .map_err(|e| PersistError::Meta(e.to_string()))?;
        let Value::Object(mut fields) = record else {
            return Err(PersistError::Meta("record is not an object".to_string()));
        };
        let items = match fields.remove(KEYS_FIELD) {
            Some(Value::Set(items)) | Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(PersistError::Meta(
                    "'keys' is neither a set nor an array".to_string(),
                ));
            }
            None => return Err(PersistError::Meta("missing 'keys'".to_string())),
        };
        let mut keys = BTreeSet::new();
        for item in items {
            match item {
                Value::String(key) => {
                    keys.insert(key);
                }
                other => {
                    return Err(PersistError::Meta(format!("non-string key {other:?}")));
                }
            }
        }
        Ok(Self { keys })
    }

    /// Encode the record. Keys are emitted in sorted order.
    pub fn serialize(&self, codec: &dyn Codec) -> PersistResult<String> {
        let keys = self.keys.iter().cloned().map(Value::String).collect();
        let mut fields = BTreeMap::new();
        fields.insert(KEYS_FIELD.to_string(), Value::Set(keys));
        codec
            .encode(&Value::Object(fields))
            .map_err(|e| PersistError::Meta(e.to_string()))
    }

    pub fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Insert `key`. Returns true if it was not present before.
    pub fn add(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string())
    }

    /// Undo an `add` whose record write failed.
    pub(crate) fn discard(&mut self, key: &str) {
        self.keys.remove(key);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_codec::GraphCodec;

    #[test]
    fn absent_record_is_empty() {
        let meta = MetaStore::load(None, &GraphCodec).unwrap();
        assert!(meta.is_empty());
    }

    #[test]
    fn add_reports_new_keys_only() {
        let mut meta = MetaStore::new();
        assert!(meta.add("a"));
        assert!(!meta.add("a"));
        assert!(meta.has("a"));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn serialize_is_sorted_set() {
        let mut meta = MetaStore::new();
        meta.add("zeta");
        meta.add("alpha");

        let record = meta.serialize(&GraphCodec).unwrap();
        assert_eq!(record, r#"{"keys":{"$set":["alpha","zeta"]}}"#);
        assert_eq!(MetaStore::load(Some(&record), &GraphCodec).unwrap(), meta);
    }

    #[test]
    fn load_accepts_plain_array() {
        let meta = MetaStore::load(Some(r#"{"keys":["a","b"]}"#), &GraphCodec).unwrap();
        assert_eq!(meta.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn malformed_records_are_errors() {
        for raw in [
            "not json",
            "[1,2]",
            r#"{"other":1}"#,
            r#"{"keys":"a"}"#,
            r#"{"keys":[1]}"#,
        ] {
            let err = MetaStore::load(Some(raw), &GraphCodec).unwrap_err();
            assert!(matches!(err, PersistError::Meta(_)), "{raw}: {err}");
        }
    }
}
