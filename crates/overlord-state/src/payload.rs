//! Typed access to JSON-valued entry maps (state data, change and task payloads)

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub(crate) type Entries = Map<String, Value>;

pub(crate) fn get<T: DeserializeOwned>(entries: &Entries, key: &str) -> Result<T> {
    match entries.get(key) {
        None | Some(Value::Null) => Err(Error::NoState),
        Some(value) => T::deserialize(value).map_err(|source| Error::Unmarshal {
            key: key.to_string(),
            source,
        }),
    }
}

/// Stores `value` under `key`; a value serializing to `null` removes the entry.
pub(crate) fn set<T: Serialize + ?Sized>(entries: &mut Entries, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value).map_err(|source| Error::Marshal {
        key: key.to_string(),
        source,
    })?;
    if value.is_null() {
        entries.remove(key);
    } else {
        entries.insert(key.to_string(), value);
    }
    Ok(())
}

pub(crate) fn has(entries: &Entries, key: &str) -> bool {
    entries.get(key).is_some_and(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snap {
        name: String,
        revision: u32,
    }

    #[test]
    fn get_missing_is_no_state() {
        let entries = Entries::new();
        let err = get::<Snap>(&entries, "snap").unwrap_err();
        assert!(err.is_no_state());
    }

    #[test]
    fn null_reads_as_no_state() {
        let mut entries = Entries::new();
        entries.insert("snap".into(), Value::Null);
        assert!(get::<Snap>(&entries, "snap").unwrap_err().is_no_state());
        assert!(!has(&entries, "snap"));
    }

    #[test]
    fn shape_mismatch_is_no_state_with_detail() {
        let mut entries = Entries::new();
        set(&mut entries, "snap", &42).unwrap();
        match get::<Snap>(&entries, "snap") {
            Err(err @ Error::Unmarshal { .. }) => {
                assert!(err.is_no_state());
                assert!(err.to_string().contains("\"snap\""));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn set_none_deletes() {
        let mut entries = Entries::new();
        set(&mut entries, "a", &Some(1)).unwrap();
        assert!(has(&entries, "a"));
        set(&mut entries, "a", &None::<i32>).unwrap();
        assert!(!entries.contains_key("a"));
    }
}
