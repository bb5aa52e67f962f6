use std::collections::HashMap;

/// One captured response, keyed in the store by its canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResource {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl CapturedResource {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.to_string(),
        }
    }

    pub fn is_stylesheet(&self) -> bool {
        match self.content_type.parse::<mime::Mime>() {
            Ok(parsed) => parsed.subtype() == mime::CSS,
            Err(_) => self.content_type.contains("css"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key already existed; the new capture was discarded.
    Duplicate,
    /// A file/directory clash was resolved by renaming `from` to `to`.
    /// When `from` is the incoming key, the new entry was stored as `to`.
    Renamed { from: String, to: String },
}

/// Ordered mapping from canonical key to captured bytes for one clone run.
///
/// Keys are unique and first-write-wins. A key that would need to be both a
/// file and a directory in the archive is split by renaming the file entry to
/// `<name>_file`.
#[derive(Debug, Default, Clone)]
pub struct ResourceStore {
    entries: HashMap<String, CapturedResource>,
    order: Vec<String>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, resource: CapturedResource) -> InsertOutcome {
        if self.entries.contains_key(key) {
            return InsertOutcome::Duplicate;
        }

        // An existing file sits where the new key needs a directory.
        let mut outcome = InsertOutcome::Inserted;
        for (idx, _) in key.match_indices('/') {
            let ancestor = &key[..idx];
            if self.entries.contains_key(ancestor) {
                let renamed = self.free_file_name(ancestor);
                self.rename(ancestor, &renamed);
                outcome = InsertOutcome::Renamed {
                    from: ancestor.to_string(),
                    to: renamed,
                };
            }
        }

        // The new key would be a file where a directory already exists.
        if self.is_directory(key) {
            let renamed = self.free_file_name(key);
            self.push(renamed.clone(), resource);
            return InsertOutcome::Renamed {
                from: key.to_string(),
                to: renamed,
            };
        }

        self.push(key.to_string(), resource);
        outcome
    }

    /// Whether inserting `key` now would move an entry to a `_file` name.
    pub fn would_rename(&self, key: &str) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        key.match_indices('/')
            .any(|(idx, _)| self.entries.contains_key(&key[..idx]))
            || self.is_directory(key)
    }

    pub fn get(&self, key: &str) -> Option<&CapturedResource> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapturedResource)> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|r| (key.as_str(), r)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn push(&mut self, key: String, resource: CapturedResource) {
        self.order.push(key.clone());
        self.entries.insert(key, resource);
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(resource) = self.entries.remove(from) {
            self.entries.insert(to.to_string(), resource);
            if let Some(slot) = self.order.iter_mut().find(|k| k.as_str() == from) {
                *slot = to.to_string();
            }
        }
    }

    fn is_directory(&self, key: &str) -> bool {
        let prefix = format!("{}/", key);
        self.order.iter().any(|k| k.starts_with(&prefix))
    }

    fn free_file_name(&self, key: &str) -> String {
        let mut candidate = format!("{}_file", key);
        let mut n = 2;
        while self.entries.contains_key(&candidate) || self.is_directory(&candidate) {
            candidate = format!("{}_file_{}", key, n);
            n += 1;
        }
        candidate
    }
}
