use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::platform::{NativePlatform, Platform};

use super::plan::{Directives, PluginSpec};

/// Per-plugin state carried across runs. `memory` belongs to the plugin's
/// own logic; the engine stores and returns it without looking inside.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRecord {
    pub last_run: Option<DateTime<Utc>>,
    pub memory: Option<Value>,
}

/// The durable document. Everything the agent remembers between
/// invocations lives here and nowhere else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub last_runs: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub memory: BTreeMap<String, Value>,
    #[serde(default)]
    pub plan: Vec<PluginSpec>,
    #[serde(default)]
    pub directives: Directives,
    #[serde(default)]
    pub plan_token: Option<String>,
    #[serde(default)]
    pub last_checkin: Option<DateTime<Utc>>,
}

pub struct HistoryStore {
    path: PathBuf,
    pub data: History,
}

impl HistoryStore {
    /// Loads the history file, creating a blank document when the file is
    /// absent. An unparsable file is treated the same as an absent one.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
            NativePlatform::restrict_dir_permissions(parent);
        }
        let data = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<History>(&bytes) {
                Ok(doc) => {
                    debug!("History file loaded.");
                    doc
                }
                Err(e) => {
                    warn!(
                        "History file at {} is corrupt ({}); reinitializing blank.",
                        path.display(),
                        e
                    );
                    History::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No history file yet, starting blank.");
                History::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("could not read history file at {}", path.display()));
            }
        };
        Ok(Self { path, data })
    }

    /// Writes the document through a sibling temp file and a rename, so a
    /// process killed mid-write leaves the previous state readable.
    pub fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .with_context(|| format!("could not write history to {}", tmp.display()))?;
        NativePlatform::restrict_file_permissions(&tmp);
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("could not replace history at {}", self.path.display()))?;
        debug!("History file saved.");
        Ok(())
    }

    /// Looks up a plugin's record, preferring the composite key and falling
    /// back to the legacy bare-name key for records persisted before plugin
    /// ids existed.
    pub fn record(&self, key: &str, legacy_key: &str) -> ExecutionRecord {
        let lookup = if self.data.last_runs.contains_key(key) || self.data.memory.contains_key(key)
        {
            key
        } else {
            legacy_key
        };
        ExecutionRecord {
            last_run: self.data.last_runs.get(lookup).copied(),
            memory: self.data.memory.get(lookup).cloned(),
        }
    }

    /// Stores a record under the composite key. A surviving legacy entry for
    /// the same plugin is removed here, which completes the one-way key
    /// migration.
    pub fn commit(&mut self, key: &str, legacy_key: &str, record: ExecutionRecord) {
        if key != legacy_key {
            self.data.last_runs.remove(legacy_key);
            self.data.memory.remove(legacy_key);
        }
        if let Some(last_run) = record.last_run {
            self.data.last_runs.insert(key.to_string(), last_run);
        }
        if let Some(memory) = record.memory {
            self.data.memory.insert(key.to_string(), memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn store_in(dir: &Path) -> HistoryStore {
        HistoryStore::load(dir.join("history.json")).unwrap()
    }

    #[test]
    fn absent_file_starts_blank() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.data.last_runs.is_empty());
        assert!(store.data.memory.is_empty());
        assert!(store.data.plan.is_empty());
        assert!(store.data.last_checkin.is_none());
    }

    #[test]
    fn round_trips_every_section_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let when = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut store = store_in(dir.path());
        store.data.last_runs.insert("1-disk".to_string(), when);
        store
            .data
            .memory
            .insert("1-disk".to_string(), json!({"seen": [1, 2, 3]}));
        store.data.plan = vec![PluginSpec {
            id: Some(1),
            name: "disk".to_string(),
            code: "(module)".to_string(),
            options: serde_json::Map::new(),
            interval: 5,
            timeout: None,
            path: None,
        }];
        store.data.directives.interval = Some(2);
        store.data.plan_token = Some("Mon, 01 Jan 2026 00:00:00 GMT".to_string());
        store.data.last_checkin = Some(when);
        store.save().unwrap();

        let reloaded = store_in(dir.path());
        assert_eq!(reloaded.data.last_runs, store.data.last_runs);
        assert_eq!(reloaded.data.memory, store.data.memory);
        assert_eq!(reloaded.data.plan, store.data.plan);
        assert_eq!(reloaded.data.directives, store.data.directives);
        assert_eq!(reloaded.data.plan_token, store.data.plan_token);
        assert_eq!(reloaded.data.last_checkin, store.data.last_checkin);
    }

    #[test]
    fn corrupt_file_reinitializes_blank() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("history.json"), "{{{ not json").unwrap();
        let store = store_in(dir.path());
        assert!(store.data.last_runs.is_empty());
        // and the blank document is saveable over the corrupt one
        store.save().unwrap();
        assert!(store_in(dir.path()).data.last_runs.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.save().unwrap();
        assert!(dir.path().join("history.json").exists());
        assert!(!dir.path().join("history.tmp").exists());
    }

    #[test]
    fn composite_key_wins_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let old = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let new = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut store = store_in(dir.path());
        store.data.last_runs.insert("disk".to_string(), old);
        store.data.last_runs.insert("1-disk".to_string(), new);

        let record = store.record("1-disk", "disk");
        assert_eq!(record.last_run, Some(new));
    }

    #[test]
    fn legacy_record_seeds_and_is_deleted_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let old = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut store = store_in(dir.path());
        store.data.last_runs.insert("disk".to_string(), old);
        store
            .data
            .memory
            .insert("disk".to_string(), json!({"carried": true}));

        let mut record = store.record("1-disk", "disk");
        assert_eq!(record.last_run, Some(old));
        assert_eq!(record.memory, Some(json!({"carried": true})));

        record.last_run = Some(now);
        store.commit("1-disk", "disk", record);

        assert!(!store.data.last_runs.contains_key("disk"));
        assert!(!store.data.memory.contains_key("disk"));
        assert_eq!(store.data.last_runs["1-disk"], now);
        assert_eq!(store.data.memory["1-disk"], json!({"carried": true}));
    }
}
