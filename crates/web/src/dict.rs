use std::collections::HashMap;

use http::HeaderMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// An ordered, multi-valued string mapping.
///
/// Keys keep the order in which they were first inserted, values keep the
/// order in which they were added to their key. Used for query strings,
/// url-encoded forms and header views.
#[derive(Debug, Clone, Default)]
pub struct HttpDict {
    entries: Vec<(String, Vec<String>)>,
    // key -> position in `entries`
    index: HashMap<String, usize>,
}

impl HttpDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `a=1&b=2&a=3` style input. `+` and percent escapes are decoded;
    /// malformed escapes are kept as they are.
    pub fn from_query(query: &str) -> Self {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
        pairs.into_iter().collect()
    }

    /// A lowercase-keyed view of `headers`. Values that are not valid UTF-8
    /// are decoded lossily.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values_mut(key.into()).push(value.into());
    }

    /// Replaces every value of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        *self.values_mut(key.into()) = vec![value.into()];
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        let position = self.index.remove(key)?;
        let (_, values) = self.entries.remove(position);
        for (k, _) in &self.entries[position..] {
            if let Some(p) = self.index.get_mut(k) {
                *p -= 1;
            }
        }
        Some(values)
    }

    /// The first value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.index.get(key).map_or(&[], |&position| self.entries[position].1.as_slice())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, values)| (k.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn values_mut(&mut self, key: String) -> &mut Vec<String> {
        let position = match self.index.get(&key) {
            Some(&position) => position,
            None => {
                self.entries.push((key.clone(), Vec::new()));
                self.index.insert(key, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        &mut self.entries[position].1
    }
}

impl PartialEq for HttpDict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for HttpDict {}

impl<K, V> FromIterator<(K, V)> for HttpDict
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Self::new();
        for (key, value) in iter {
            dict.append(key, value);
        }
        dict
    }
}

impl Serialize for HttpDict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}
