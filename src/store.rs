//! Persistent time-series storage with prefix-indexed keys.
//!
//! Observed response data is kept in one tabular store file holding a table
//! per key, with keys of the canonical form
//! `<experiment_key>/<run_key>/<response_key>`. A character trie over all
//! keys lives in a sidecar file and answers prefix queries in descending
//! lexicographic order. Every successful table write inserts the key into
//! the trie afterwards, keeping the two files consistent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::responses::ResponseData;

/// Default file name of the table store.
pub const STORAGE_NAME: &str = "oxn-store.json";
/// Default file name of the serialized trie.
pub const TRIE_NAME: &str = "oxn-trie.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrieNode {
    end: bool,
    children: BTreeMap<char, TrieNode>,
}

/// A character trie over store keys supporting prefix queries.
#[derive(Debug, Default)]
pub struct Trie {
    root: TrieNode,
    disk_path: Option<PathBuf>,
}

impl Trie {
    /// An in-memory trie, for tests and scratch work.
    pub fn new() -> Self {
        Self::default()
    }

    /// A disk-backed trie. An existing file is deserialized; a missing file
    /// starts empty.
    pub fn with_disk(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let root = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })?
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => TrieNode::default(),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Ok(Self {
            root,
            disk_path: Some(path),
        })
    }

    /// Insert a storage key and persist the trie when disk-backed.
    pub fn insert(&mut self, key: &str) -> Result<(), StoreError> {
        let mut node = &mut self.root;
        for character in key.chars() {
            node = node.children.entry(character).or_default();
        }
        node.end = true;
        self.serialize()
    }

    /// Collect all keys under a prefix, sorted descending. The empty prefix
    /// returns every key in the trie.
    pub fn query(&self, prefix: &str) -> Vec<String> {
        let mut node = &self.root;
        for character in prefix.chars() {
            match node.children.get(&character) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        let mut keys = Vec::new();
        collect(node, prefix.to_string(), &mut keys);
        keys.sort_unstable_by(|a, b| b.cmp(a));
        keys
    }

    fn serialize(&self) -> Result<(), StoreError> {
        let Some(path) = &self.disk_path else {
            return Ok(());
        };
        let contents = serde_json::to_string(&self.root).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, contents).map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}

fn collect(node: &TrieNode, prefix: String, keys: &mut Vec<String>) {
    if node.end {
        keys.push(prefix.clone());
    }
    for (character, child) in &node.children {
        let mut next = prefix.clone();
        next.push(*character);
        collect(child, next, keys);
    }
}

/// Construct a storage key from experiment, run, and response keys.
pub fn construct_key(experiment_key: &str, run_key: &str, response_key: &str) -> String {
    format!("{experiment_key}/{run_key}/{response_key}")
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTable {
    data: ResponseData,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    tables: BTreeMap<String, StoredTable>,
}

/// The persistent table store plus its trie index.
///
/// Access is single-writer within a process; cross-process concurrency is
/// out of scope.
pub struct Store {
    storage_path: PathBuf,
    trie: Trie,
}

impl Store {
    /// Open (or create) a store rooted at a directory, using the default
    /// file names.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let directory = directory.as_ref();
        Ok(Self {
            storage_path: directory.join(STORAGE_NAME),
            trie: Trie::with_disk(directory.join(TRIE_NAME))?,
        })
    }

    fn load(&self) -> Result<StoreFile, StoreError> {
        match std::fs::read_to_string(&self.storage_path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                    path: self.storage_path.display().to_string(),
                    source,
                })
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(StoreFile::default())
            }
            Err(source) => Err(StoreError::Read {
                path: self.storage_path.display().to_string(),
                source,
            }),
        }
    }

    fn save(&self, file: &StoreFile) -> Result<(), StoreError> {
        let contents = serde_json::to_string(file).map_err(|source| StoreError::Corrupt {
            path: self.storage_path.display().to_string(),
            source,
        })?;
        std::fs::write(&self.storage_path, contents).map_err(|source| StoreError::Write {
            path: self.storage_path.display().to_string(),
            source,
        })
    }

    /// Write a table under `experiment/run/response`. The trie is updated
    /// only after the table write succeeds.
    pub fn write(
        &mut self,
        data: &ResponseData,
        experiment_key: &str,
        run_key: &str,
        response_key: &str,
    ) -> Result<String, StoreError> {
        let key = construct_key(experiment_key, run_key, response_key);
        let mut file = self.load()?;
        file.tables.insert(
            key.clone(),
            StoredTable {
                data: data.clone(),
                metadata: BTreeMap::new(),
            },
        );
        self.save(&file)?;
        self.trie.insert(&key)?;
        Ok(key)
    }

    /// Retrieve a table by key.
    pub fn get(&self, key: &str) -> Result<ResponseData, StoreError> {
        let file = self.load()?;
        file.tables
            .get(key)
            .map(|table| table.data.clone())
            .ok_or_else(|| StoreError::MissingKey {
                key: key.to_string(),
            })
    }

    /// Remove a table by key.
    pub fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let mut file = self.load()?;
        if file.tables.remove(key).is_none() {
            return Err(StoreError::MissingKey {
                key: key.to_string(),
            });
        }
        self.save(&file)
    }

    /// Attach metadata to a stored table, merging with existing keys.
    pub fn annotate(
        &mut self,
        key: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut file = self.load()?;
        let table = file.tables.get_mut(key).ok_or_else(|| StoreError::MissingKey {
            key: key.to_string(),
        })?;
        table.metadata.extend(metadata);
        self.save(&file)
    }

    /// All keys for an experiment, descending.
    pub fn list_for_experiment(&self, experiment_key: &str) -> Vec<String> {
        self.trie.query(experiment_key)
    }

    /// All keys for one run of an experiment, descending.
    pub fn list_for_run(&self, experiment_key: &str, run_key: &str) -> Vec<String> {
        self.trie.query(&format!("{experiment_key}/{run_key}"))
    }

    /// Concatenate all per-run tables of one response across an experiment.
    pub fn consolidate_runs(
        &self,
        experiment_key: &str,
        response_key: &str,
    ) -> Result<Option<ResponseData>, StoreError> {
        let keys: Vec<String> = self
            .trie
            .query(experiment_key)
            .into_iter()
            .filter(|key| key.rsplit('/').next() == Some(response_key))
            .collect();
        let mut consolidated: Option<ResponseData> = None;
        for key in keys {
            let data = self.get(&key)?;
            consolidated = Some(match (consolidated, data) {
                (None, data) => data,
                (Some(ResponseData::Metrics(mut rows)), ResponseData::Metrics(more)) => {
                    rows.extend(more);
                    ResponseData::Metrics(rows)
                }
                (Some(ResponseData::Traces(mut rows)), ResponseData::Traces(more)) => {
                    rows.extend(more);
                    ResponseData::Traces(rows)
                }
                (Some(existing), _) => {
                    tracing::warn!(key, "skipping table of mismatched kind during consolidation");
                    existing
                }
            });
        }
        Ok(consolidated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responses::MetricRow;
    use pretty_assertions::assert_eq;

    fn metric_data(values: &[f64]) -> ResponseData {
        ResponseData::Metrics(
            values
                .iter()
                .enumerate()
                .map(|(index, value)| MetricRow {
                    labels: BTreeMap::new(),
                    timestamp: index as f64,
                    value: *value,
                    treatment_labels: BTreeMap::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn trie_query_returns_inserted_keys_descending() {
        let mut trie = Trie::new();
        trie.insert("experiment/run1/response").expect("insert");
        trie.insert("experiment/run2/response").expect("insert");
        trie.insert("other/run1/response").expect("insert");

        let all = trie.query("");
        assert_eq!(
            all,
            vec![
                "other/run1/response",
                "experiment/run2/response",
                "experiment/run1/response",
            ]
        );

        let scoped = trie.query("experiment");
        assert_eq!(
            scoped,
            vec!["experiment/run2/response", "experiment/run1/response"]
        );
        assert!(trie.query("missing").is_empty());
    }

    #[test]
    fn trie_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(TRIE_NAME);
        {
            let mut trie = Trie::with_disk(&path).expect("open");
            trie.insert("experiment/run/response").expect("insert");
        }
        let trie = Trie::with_disk(&path).expect("reopen");
        assert_eq!(trie.query("experiment"), vec!["experiment/run/response"]);
    }

    #[test]
    fn write_then_get_round_trips_a_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let data = metric_data(&[1.0, 2.0, 3.0]);

        let key = store
            .write(&data, "spec.yml", "abcd1234", "latency")
            .expect("write");
        assert_eq!(key, "spec.yml/abcd1234/latency");
        assert_eq!(store.get(&key).expect("get"), data);
    }

    #[test]
    fn missing_keys_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("open");
        let err = store.get("nope/nope/nope").expect_err("must fail");
        assert!(matches!(err, StoreError::MissingKey { .. }));
    }

    #[test]
    fn listing_scopes_to_experiment_and_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let data = metric_data(&[1.0]);
        store.write(&data, "spec.yml", "run1", "latency").expect("write");
        store.write(&data, "spec.yml", "run2", "latency").expect("write");
        store.write(&data, "other.yml", "run1", "latency").expect("write");

        assert_eq!(store.list_for_experiment("spec.yml").len(), 2);
        assert_eq!(
            store.list_for_run("spec.yml", "run1"),
            vec!["spec.yml/run1/latency"]
        );
    }

    #[test]
    fn consolidation_concatenates_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        store
            .write(&metric_data(&[1.0, 2.0]), "spec.yml", "run1", "latency")
            .expect("write");
        store
            .write(&metric_data(&[3.0]), "spec.yml", "run2", "latency")
            .expect("write");
        store
            .write(&metric_data(&[9.0]), "spec.yml", "run1", "errors")
            .expect("write");

        let consolidated = store
            .consolidate_runs("spec.yml", "latency")
            .expect("consolidate")
            .expect("has data");
        assert_eq!(consolidated.len(), 3);
    }

    #[test]
    fn annotation_merges_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let key = store
            .write(&metric_data(&[1.0]), "spec.yml", "run1", "latency")
            .expect("write");

        let mut metadata = BTreeMap::new();
        metadata.insert("note".to_string(), serde_json::json!("baseline"));
        store.annotate(&key, metadata).expect("annotate");

        let mut more = BTreeMap::new();
        more.insert("iteration".to_string(), serde_json::json!(1));
        store.annotate(&key, more).expect("annotate again");

        let file = store.load().expect("load");
        let table = &file.tables[&key];
        assert_eq!(table.metadata.len(), 2);
    }

    #[test]
    fn remove_deletes_the_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let key = store
            .write(&metric_data(&[1.0]), "spec.yml", "run1", "latency")
            .expect("write");
        store.remove(&key).expect("remove");
        assert!(store.get(&key).is_err());
    }
}
