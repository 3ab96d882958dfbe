//! Property list editing.
//!
//! Bundle metadata (`Info.plist`), entitlements and OTA install manifests
//! are all property lists. [`PropertyList`] wraps a root dictionary and
//! offers path-based reads and writes so tasks can patch nested keys
//! without hand-walking [`plist::Value`] trees.
//!
//! Input may be XML or binary; output is always XML.

use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// An editable property list with a dictionary root.
#[derive(Debug, Clone, Default)]
pub struct PropertyList {
    root: Dictionary,
    path: Option<PathBuf>,
}

impl PropertyList {
    /// Creates an empty property list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a property list from disk, remembering the path for
    /// [`save`](Self::save).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let mut plist = Self::from_bytes(&data)
            .map_err(|e| Error::format(format!("{}: {}", path.display(), e)))?;
        plist.path = Some(path.to_path_buf());
        Ok(plist)
    }

    /// Parses XML or binary plist bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the document does not parse or its root
    /// is not a dictionary.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value = plist::from_bytes(data)
            .map_err(|e| Error::format(format!("Failed to parse plist: {}", e)))?;
        match value {
            Value::Dictionary(root) => Ok(Self { root, path: None }),
            _ => Err(Error::format("Property list root is not a dictionary")),
        }
    }

    pub fn from_dictionary(root: Dictionary) -> Self {
        Self { root, path: None }
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.root
    }

    pub fn into_dictionary(self) -> Dictionary {
        self.root
    }

    /// Looks up a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Looks up a nested key, descending through dictionaries.
    ///
    /// Keys are passed as a slice because plist keys routinely contain
    /// dots (`com.apple.developer.team-identifier`).
    pub fn get_path(&self, keys: &[&str]) -> Option<&Value> {
        let (last, parents) = keys.split_last()?;
        let mut dict = &self.root;
        for key in parents {
            dict = dict.get(*key)?.as_dictionary()?;
        }
        dict.get(*last)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_string)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_boolean)
    }

    /// Sets a top-level key, replacing any existing value.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.root.insert(key.to_string(), value.into());
        self
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.set(key, Value::String(value.into()))
    }

    /// Sets a nested key, creating intermediate dictionaries as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if an intermediate key exists but is not a
    /// dictionary, or if `keys` is empty.
    pub fn set_path(&mut self, keys: &[&str], value: impl Into<Value>) -> Result<&mut Self> {
        let (last, parents) = keys
            .split_last()
            .ok_or_else(|| Error::format("Empty key path"))?;

        let mut dict = &mut self.root;
        for key in parents {
            if !dict.contains_key(*key) {
                dict.insert(key.to_string(), Value::Dictionary(Dictionary::new()));
            }
            dict = dict
                .get_mut(*key)
                .and_then(Value::as_dictionary_mut)
                .ok_or_else(|| Error::format(format!("Key {} is not a dictionary", key)))?;
        }
        dict.insert(last.to_string(), value.into());
        Ok(self)
    }

    /// Appends to an array value, creating the array if the key is absent.
    pub fn push(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        if !self.root.contains_key(key) {
            self.root.insert(key.to_string(), Value::Array(Vec::new()));
        }
        self.root
            .get_mut(key)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Error::format(format!("Key {} is not an array", key)))?
            .push(value.into());
        Ok(self)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.root.remove(key)
    }

    /// Serializes to an XML property list.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(self.root.clone()))?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Writes the document to `path` as XML.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_xml()?)?;
        Ok(())
    }

    /// Writes the document back to the path it was opened from.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Config("Property list has no backing file".into()))?;
        self.save_to(path)
    }
}
