use crate::error::MapError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Read-only key lookups consumed by symbol callbacks. The wire protocol
/// behind a map is not the core's business; file-backed maps below are the
/// one implementation shipped here.
pub trait Map: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn get_key(&self, key: &str) -> bool;
    fn reload(&self) -> Result<usize, MapError>;
}

/// A line-oriented `key [value]` file. Keys are lowercased; `#` starts a
/// comment. `reload` keeps the previous contents when the file cannot be
/// read, so a broken update never empties a live map.
pub struct FileMap {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileMap {
    pub fn load(path: impl AsRef<Path>) -> Result<FileMap, MapError> {
        let map = FileMap {
            path: path.as_ref().to_path_buf(),
            entries: RwLock::new(HashMap::new()),
        };
        map.reload()?;
        Ok(map)
    }

    fn parse(text: &str) -> HashMap<String, String> {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((key, value)) => {
                    entries.insert(key.to_lowercase(), value.trim().to_string());
                }
                None => {
                    entries.insert(line.to_lowercase(), String::new());
                }
            }
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Map for FileMap {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(&key.to_lowercase()).cloned())
    }

    fn get_key(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(&key.to_lowercase()))
            .unwrap_or(false)
    }

    fn reload(&self) -> Result<usize, MapError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(source) => {
                log::error!(
                    "map {} reload failed, keeping previous contents: {source}",
                    self.path.display()
                );
                return Err(MapError::Read {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };
        let parsed = Self::parse(&text);
        let count = parsed.len();
        if let Ok(mut entries) = self.entries.write() {
            *entries = parsed;
        }
        log::debug!("map {} loaded, {count} entries", self.path.display());
        Ok(count)
    }
}

/// A fixed in-memory map, for settings-driven lists and tests.
#[derive(Default)]
pub struct StaticMap {
    entries: HashMap<String, String>,
}

impl StaticMap {
    pub fn from_keys<I, S>(keys: I) -> StaticMap
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StaticMap {
            entries: keys
                .into_iter()
                .map(|k| (k.into().to_lowercase(), String::new()))
                .collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> StaticMap
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        StaticMap {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into().to_lowercase(), v.into()))
                .collect(),
        }
    }
}

impl Map for StaticMap {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(&key.to_lowercase()).cloned()
    }

    fn get_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    fn reload(&self) -> Result<usize, MapError> {
        Ok(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_map_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# blocklist").unwrap();
        writeln!(file, "SPAMMER.example  known bad").unwrap();
        writeln!(file, "other.test").unwrap();
        file.flush().unwrap();

        let map = FileMap::load(file.path()).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.get_key("spammer.example"));
        assert!(map.get_key("Other.Test"));
        assert_eq!(map.get("spammer.example").as_deref(), Some("known bad"));
        assert_eq!(map.get("other.test").as_deref(), Some(""));
        assert!(!map.get_key("absent.example"));
    }

    #[test]
    fn test_reload_keeps_previous_on_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "keep.example").unwrap();
        file.flush().unwrap();

        let map = FileMap::load(file.path()).unwrap();
        assert!(map.get_key("keep.example"));

        let path = file.path().to_path_buf();
        drop(file);
        assert!(map.reload().is_err());
        // old contents still served
        assert!(map.get_key("keep.example"));
        let _ = path;
    }

    #[test]
    fn test_static_map() {
        let map = StaticMap::from_keys(["One.Example", "two.example"]);
        assert!(map.get_key("one.example"));
        assert!(map.get_key("TWO.EXAMPLE"));
        assert!(!map.get_key("three.example"));
    }
}
