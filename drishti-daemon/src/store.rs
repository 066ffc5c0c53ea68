//! On-disk trigger definitions.
//!
//! Each trigger unit is a directory under the store root:
//!
//! ```text
//! <root>/<key>/manifest.json     identity, type, cadence, gate, action
//! <root>/<key>/zones.json        array of zones
//! <root>/<key>/conditions.json   condition parameters
//! <root>/.backups/<key>/<stamp>/ full copies taken before every mutation
//! ```
//!
//! A unit is written into a staging directory and renamed into place, so a
//! reader never sees a half-written unit. Corrupt units are skipped with a
//! warning and never block the rest of the store.

use crate::error::{DaemonError, Result};
use crate::ipc::write_json_atomic;
use chrono::{DateTime, NaiveDateTime, Utc};
use drishti_core::{Condition, Gate, Trigger, TriggerAction, TriggerKind, TriggerUnit, Zone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ZONES_FILE: &str = "zones.json";
pub const CONDITIONS_FILE: &str = "conditions.json";

const BACKUP_DIR: &str = ".backups";
const STAGING_DIR: &str = ".staging";
const BACKUP_STAMP: &str = "%Y%m%dT%H%M%S%.6fZ";
const MAX_KEY_LEN: usize = 64;

/// Everything in a trigger definition except its condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: TriggerKind,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_check_interval")]
    check_interval_seconds: f64,
    #[serde(default)]
    active_when: Gate,
    #[serde(default)]
    action: TriggerAction,
}

fn default_enabled() -> bool {
    true
}

fn default_check_interval() -> f64 {
    5.0
}

impl Manifest {
    fn from_trigger(trigger: &Trigger) -> Self {
        Self {
            id: trigger.id.clone(),
            name: trigger.name.clone(),
            kind: trigger.kind,
            enabled: trigger.enabled,
            check_interval_seconds: trigger.check_interval_seconds,
            active_when: trigger.active_when.clone(),
            action: trigger.action.clone(),
        }
    }

    fn into_trigger(self, condition: Condition) -> Trigger {
        Trigger {
            id: self.id,
            name: self.name,
            kind: self.kind,
            enabled: self.enabled,
            check_interval_seconds: self.check_interval_seconds,
            active_when: self.active_when,
            action: self.action,
            condition,
        }
    }
}

/// Listing entry for a well-formed unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSummary {
    pub key: String,
    pub id: String,
    pub name: String,
    pub kind: TriggerKind,
    pub enabled: bool,
    pub zones: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    /// Directory name, used to select a backup for restore.
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Outcome of scanning the whole store.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Well-formed units in key order.
    pub units: Vec<(String, TriggerUnit)>,
    /// Keys that could not be loaded, with the reason.
    pub skipped: Vec<(String, DaemonError)>,
}

/// Turn a trigger name into a directory key.
///
/// Keeps ASCII alphanumerics, `-` and `_`; everything else becomes `_`.
/// Names that reduce to nothing, or would start with `.`, are rejected.
pub fn sanitize_key(name: &str) -> Result<String> {
    let key: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_KEY_LEN)
        .collect();
    if key.is_empty() || key.chars().all(|c| c == '_') {
        return Err(DaemonError::Store(format!("invalid trigger name {:?}", name)));
    }
    Ok(key)
}

fn store_err(action: &str, path: &Path, e: impl std::fmt::Display) -> DaemonError {
    DaemonError::Store(format!("Failed to {} {}: {}", action, path.display(), e))
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| store_err("read", path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        DaemonError::Core(drishti_core::Error::MalformedTrigger(format!(
            "{}: {}",
            path.display(),
            e
        )))
    })
}

/// Parse a unit directory without checking referential integrity.
fn read_unit_dir(dir: &Path) -> Result<TriggerUnit> {
    let manifest: Manifest = read_document(&dir.join(MANIFEST_FILE))?;

    let zones_path = dir.join(ZONES_FILE);
    let raw_zones: Vec<serde_json::Value> = read_document(&zones_path)?;
    let zones = raw_zones
        .into_iter()
        .map(Zone::from_value)
        .collect::<drishti_core::Result<Vec<_>>>()?;

    let condition: Condition = read_document(&dir.join(CONDITIONS_FILE))?;
    Ok(TriggerUnit {
        trigger: manifest.into_trigger(condition),
        zones,
    })
}

fn write_unit_dir(dir: &Path, unit: &TriggerUnit) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| store_err("create", dir, e))?;
    write_json_atomic(&dir.join(MANIFEST_FILE), &Manifest::from_trigger(&unit.trigger))?;
    write_json_atomic(&dir.join(ZONES_FILE), &unit.zones)?;
    write_json_atomic(&dir.join(CONDITIONS_FILE), &unit.trigger.condition)?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| store_err("create", to, e))?;
    for entry in fs::read_dir(from).map_err(|e| store_err("read", from, e))? {
        let entry = entry.map_err(|e| store_err("read", from, e))?;
        let path = entry.path();
        if path.is_file() {
            let target = to.join(entry.file_name());
            fs::copy(&path, &target).map_err(|e| store_err("copy", &path, e))?;
        }
    }
    Ok(())
}

/// CRUD over trigger units with automatic backups.
#[derive(Debug, Clone)]
pub struct TriggerStore {
    root: PathBuf,
    retention: usize,
}

impl TriggerStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| store_err("create", &root, e))?;
        let store = Self {
            root,
            retention: retention.max(1),
        };
        store.cleanup_staging();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn backup_root(&self, key: &str) -> PathBuf {
        self.root.join(BACKUP_DIR).join(key)
    }

    /// Remove staging leftovers from an interrupted save.
    fn cleanup_staging(&self) {
        let staging = self.root.join(STAGING_DIR);
        if staging.exists() {
            match fs::remove_dir_all(&staging) {
                Ok(()) => info!("Removed interrupted staging area {}", staging.display()),
                Err(e) => warn!("Failed to remove staging area {}: {}", staging.display(), e),
            }
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = fs::read_dir(&self.root)
            .map_err(|e| store_err("read", &self.root, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Read every unit. Malformed units are reported in `skipped`.
    pub fn scan(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for key in self.keys()? {
            match read_unit_dir(&self.unit_dir(&key)).and_then(|unit| {
                unit.validate()?;
                Ok(unit)
            }) {
                Ok(unit) => report.units.push((key, unit)),
                Err(e) => {
                    warn!(key = %key, "Skipping trigger unit: {}", e);
                    report.skipped.push((key, e));
                }
            }
        }
        Ok(report)
    }

    /// Well-formed units only.
    pub fn list(&self) -> Result<Vec<UnitSummary>> {
        Ok(self
            .scan()?
            .units
            .into_iter()
            .map(|(key, unit)| UnitSummary {
                key,
                id: unit.trigger.id.clone(),
                name: unit.trigger.name.clone(),
                kind: unit.trigger.kind,
                enabled: unit.trigger.enabled,
                zones: unit.zones.len(),
            })
            .collect())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.unit_dir(&sanitize_key(name)?).is_dir())
    }

    /// Load and validate one unit.
    pub fn load(&self, name: &str) -> Result<TriggerUnit> {
        let key = sanitize_key(name)?;
        let dir = self.unit_dir(&key);
        if !dir.is_dir() {
            return Err(DaemonError::Store(format!("no trigger named {:?}", name)));
        }
        let unit = read_unit_dir(&dir)?;
        unit.validate()?;
        Ok(unit)
    }

    /// Same as [`load`](Self::load); kept separate for the CLI's `validate` verb.
    pub fn validate(&self, name: &str) -> Result<TriggerUnit> {
        self.load(name)
    }

    /// Enabled units in key order.
    ///
    /// With `strict`, a dangling zone reference in an enabled unit fails the whole
    /// load; other malformed units are always skipped.
    pub fn load_enabled(&self, strict: bool) -> Result<Vec<TriggerUnit>> {
        let report = self.scan()?;
        for (key, error) in &report.skipped {
            if !strict {
                continue;
            }
            if let DaemonError::Core(drishti_core::Error::DanglingZone { .. }) = error {
                let enabled = read_unit_dir(&self.unit_dir(key))
                    .map(|unit| unit.trigger.enabled)
                    .unwrap_or(true);
                if enabled {
                    return Err(DaemonError::Store(format!("unit {}: {}", key, error)));
                }
            }
        }
        let units: Vec<TriggerUnit> = report
            .units
            .into_iter()
            .map(|(_, unit)| unit)
            .filter(|unit| unit.trigger.enabled)
            .collect();
        info!(
            "Loaded {} enabled triggers ({} skipped)",
            units.len(),
            report.skipped.len()
        );
        Ok(units)
    }

    /// Create or replace a unit. The previous version is backed up first.
    pub fn save(&self, name: &str, unit: &TriggerUnit) -> Result<String> {
        let key = sanitize_key(name)?;
        unit.validate()?;

        let target = self.unit_dir(&key);
        if target.is_dir() {
            self.backup(&key)?;
        }

        let stamped = format!("{}-{}", key, Utc::now().format("%Y%m%d%H%M%S%f"));
        let staging = self.root.join(STAGING_DIR).join(&stamped);
        write_unit_dir(&staging, unit)?;

        // Old version is deleted only after the new one is in place.
        let retired = self.root.join(STAGING_DIR).join(format!("{}.old", stamped));
        let replacing = target.is_dir();
        if replacing {
            fs::rename(&target, &retired).map_err(|e| {
                let _ = fs::remove_dir_all(&staging);
                store_err("move aside", &target, e)
            })?;
        }
        if let Err(e) = fs::rename(&staging, &target) {
            if replacing {
                if let Err(back) = fs::rename(&retired, &target) {
                    warn!("Failed to put back {}: {}", target.display(), back);
                }
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(store_err("move into place", &target, e));
        }
        if replacing {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Failed to remove retired unit {}: {}", retired.display(), e);
            }
        }
        info!(key = %key, "Saved trigger unit");
        Ok(key)
    }

    /// Delete a unit after backing it up.
    pub fn delete(&self, name: &str) -> Result<()> {
        let key = sanitize_key(name)?;
        let target = self.unit_dir(&key);
        if !target.is_dir() {
            return Err(DaemonError::Store(format!("no trigger named {:?}", name)));
        }
        self.backup(&key)?;
        fs::remove_dir_all(&target).map_err(|e| store_err("remove", &target, e))?;
        info!(key = %key, "Deleted trigger unit");
        Ok(())
    }

    /// Copy the current unit into a new timestamped backup and prune.
    fn backup(&self, key: &str) -> Result<BackupInfo> {
        let root = self.backup_root(key);
        let created_at = Utc::now();
        let stamp = created_at.format(BACKUP_STAMP).to_string();
        let mut name = stamp.clone();
        let mut suffix = 1;
        while root.join(&name).exists() {
            name = format!("{}-{}", stamp, suffix);
            suffix += 1;
        }
        let path = root.join(&name);
        copy_dir(&self.unit_dir(key), &path)?;
        debug!(key = %key, backup = %name, "Backed up trigger unit");
        self.prune_backups(key)?;
        Ok(BackupInfo {
            name,
            created_at,
            path,
        })
    }

    fn prune_backups(&self, key: &str) -> Result<()> {
        let backups = self.backups_for_key(key)?;
        for stale in backups.iter().skip(self.retention) {
            if let Err(e) = fs::remove_dir_all(&stale.path) {
                warn!("Failed to prune backup {}: {}", stale.path.display(), e);
            }
        }
        Ok(())
    }

    /// Backups newest first.
    fn backups_for_key(&self, key: &str) -> Result<Vec<BackupInfo>> {
        let root = self.backup_root(key);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut backups: Vec<BackupInfo> = fs::read_dir(&root)
            .map_err(|e| store_err("read", &root, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let stamp = name.split('-').next()?;
                let created_at = NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP)
                    .ok()?
                    .and_utc();
                Some(BackupInfo {
                    name,
                    created_at,
                    path: entry.path(),
                })
            })
            .collect();
        backups.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(backups)
    }

    pub fn list_backups(&self, name: &str) -> Result<Vec<BackupInfo>> {
        self.backups_for_key(&sanitize_key(name)?)
    }

    /// Replace the unit with the contents of `backup`. The current version,
    /// if any, is backed up first.
    pub fn restore_backup(&self, name: &str, backup: &str) -> Result<TriggerUnit> {
        let key = sanitize_key(name)?;
        let source = self
            .backups_for_key(&key)?
            .into_iter()
            .find(|b| b.name == backup)
            .ok_or_else(|| DaemonError::Store(format!("no backup {:?} for {:?}", backup, name)))?;
        let unit = read_unit_dir(&source.path)?;
        self.save(&key, &unit)?;
        info!(key = %key, backup = %backup, "Restored trigger unit");
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence_unit(id: &str) -> TriggerUnit {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("{} trigger", id),
            "type": "presence",
            "condition": {"type": "presence", "zone_id": "tray"}
        }))
        .unwrap();
        TriggerUnit::new(trigger, vec![Zone::rectangle("tray", 0.0, 0.0, 10.0, 10.0).unwrap()]).unwrap()
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("Pick Tray").unwrap(), "pick_tray");
        assert_eq!(sanitize_key("../etc/passwd").unwrap(), "___etc_passwd");
        assert_eq!(sanitize_key("  bin-2_a ").unwrap(), "bin-2_a");
        assert!(sanitize_key("").is_err());
        assert!(sanitize_key("...").is_err());
        assert_eq!(sanitize_key(&"x".repeat(200)).unwrap().len(), MAX_KEY_LEN);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        let unit = presence_unit("pick");
        let key = store.save("Pick", &unit).unwrap();
        assert_eq!(key, "pick");
        assert!(dir.path().join("pick").join(MANIFEST_FILE).is_file());
        assert_eq!(store.load("pick").unwrap(), unit);
        assert!(store.exists("PICK").unwrap());
    }

    #[test]
    fn test_overwrite_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        store.save("pick", &presence_unit("pick")).unwrap();
        assert!(store.list_backups("pick").unwrap().is_empty());

        let mut changed = presence_unit("pick");
        changed.trigger.check_interval_seconds = 1.0;
        store.save("pick", &changed).unwrap();
        let backups = store.list_backups("pick").unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(store.load("pick").unwrap().trigger.check_interval_seconds, 1.0);
    }

    #[test]
    fn test_overwrite_leaves_no_retired_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        store.save("pick", &presence_unit("pick")).unwrap();
        for interval in [1.0, 2.0, 3.0] {
            let mut changed = presence_unit("pick");
            changed.trigger.check_interval_seconds = interval;
            store.save("pick", &changed).unwrap();
        }
        assert_eq!(store.load("pick").unwrap().trigger.check_interval_seconds, 3.0);
        assert_eq!(store.list_backups("pick").unwrap().len(), 3);

        let staged: Vec<_> = fs::read_dir(dir.path().join(STAGING_DIR))
            .map(|entries| entries.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(staged.is_empty(), "leftovers: {:?}", staged);
        let keys: Vec<String> = store.list().unwrap().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["pick".to_string()]);
    }

    #[test]
    fn test_failed_swap_keeps_previous_unit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        store.save("pick", &presence_unit("pick")).unwrap();
        // a file where the staging directory should go makes the write fail
        fs::write(dir.path().join(STAGING_DIR), b"").unwrap();

        let mut changed = presence_unit("pick");
        changed.trigger.check_interval_seconds = 9.0;
        assert!(store.save("pick", &changed).is_err());
        assert_eq!(store.load("pick").unwrap(), presence_unit("pick"));
    }

    #[test]
    fn test_restore_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        let original = presence_unit("pick");
        store.save("pick", &original).unwrap();
        let mut changed = original.clone();
        changed.trigger.enabled = false;
        store.save("pick", &changed).unwrap();

        let backup = store.list_backups("pick").unwrap().remove(0);
        let restored = store.restore_backup("pick", &backup.name).unwrap();
        assert_eq!(restored, original);
        assert_eq!(store.load("pick").unwrap(), original);
        assert_eq!(store.list_backups("pick").unwrap().len(), 2);
        assert!(store.restore_backup("pick", "missing").is_err());
    }

    #[test]
    fn test_backups_pruned_to_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 3).unwrap();
        let mut unit = presence_unit("pick");
        for i in 0..6 {
            unit.trigger.check_interval_seconds = i as f64;
            store.save("pick", &unit).unwrap();
        }
        assert_eq!(store.list_backups("pick").unwrap().len(), 3);
    }

    #[test]
    fn test_delete_backs_up_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        store.save("pick", &presence_unit("pick")).unwrap();
        store.delete("pick").unwrap();
        assert!(!store.exists("pick").unwrap());
        assert_eq!(store.list_backups("pick").unwrap().len(), 1);
        assert!(store.delete("pick").is_err());
    }

    #[test]
    fn test_corrupt_unit_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        store.save("a", &presence_unit("a")).unwrap();
        store.save("c", &presence_unit("c")).unwrap();
        let broken = dir.path().join("b");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(MANIFEST_FILE), b"{ not json").unwrap();

        let report = store.scan().unwrap();
        let keys: Vec<&str> = report.units.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.load_enabled(true).unwrap().len(), 2);
    }

    #[test]
    fn test_save_rejects_invalid_unit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        let mut unit = presence_unit("pick");
        unit.zones.clear();
        assert!(store.save("pick", &unit).is_err());
        assert!(!store.exists("pick").unwrap());
    }

    #[test]
    fn test_staging_leftovers_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(STAGING_DIR).join("half")).unwrap();
        let store = TriggerStore::open(dir.path(), 10).unwrap();
        assert!(!dir.path().join(STAGING_DIR).exists());
        assert!(store.list().unwrap().is_empty());
    }
}
