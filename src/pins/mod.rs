use crate::command::EntityRef;
use crate::config::SynqConfig;
use crate::error::StoreError;
use crate::lock::LockController;
use crate::query::{QueryPredicate, QuerySource};
use crate::transport::CanonicalEntityState;
use crc32c::crc32c;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const PIN_TABLE_FILE: &str = "pins.synq";
const PIN_TABLE_MAGIC: u32 = 0x5350_494E;
const PIN_TABLE_VERSION: u16 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PinTable {
    snapshots: BTreeMap<EntityRef, CanonicalEntityState>,
    pins: BTreeMap<String, BTreeSet<EntityRef>>,
}

impl PinTable {
    fn membership_count(&self, key: &EntityRef) -> usize {
        self.pins.values().filter(|members| members.contains(key)).count()
    }

    fn evict_if_unpinned(&mut self, key: &EntityRef) {
        if self.membership_count(key) == 0 {
            self.snapshots.remove(key);
        }
    }
}

/// Keyed, reference-counted cache of entity snapshots organized into named
/// retention groups.
///
/// A snapshot stays resident while at least one pin claims it; membership
/// counts are derived from the persisted pin sets, so they survive
/// restarts by construction. The whole table is one atomically-replaced
/// file guarded by the shared inter-process lock.
#[derive(Debug)]
pub struct LocalPinnedStore {
    dir: PathBuf,
    path: PathBuf,
    lock: LockController,
    config: SynqConfig,
    state: Mutex<PinTable>,
}

impl LocalPinnedStore {
    pub fn open(
        data_dir: &Path,
        lock: LockController,
        config: SynqConfig,
    ) -> Result<Self, StoreError> {
        let path = data_dir.join(PIN_TABLE_FILE);
        let table = if path.exists() {
            match load_table(&path) {
                Ok(table) => table,
                Err(err) if config.strict_recovery() => {
                    return Err(StoreError::Corrupt {
                        path: path.display().to_string(),
                        detail: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "pin table unreadable, starting empty");
                    PinTable::default()
                }
            }
        } else {
            PinTable::default()
        };
        Ok(Self {
            dir: data_dir.to_path_buf(),
            path,
            lock,
            config,
            state: Mutex::new(table),
        })
    }

    /// Stores a snapshot and claims it for every named pin. A snapshot
    /// claimed by no pin is not retained.
    pub fn put(
        &self,
        state: CanonicalEntityState,
        pins: &[String],
    ) -> Result<(), StoreError> {
        let key = state.entity.clone();
        {
            let mut table = self.state.lock();
            table.snapshots.insert(key.clone(), state);
            for pin in pins {
                table.pins.entry(pin.clone()).or_default().insert(key.clone());
            }
            table.evict_if_unpinned(&key);
        }
        self.save()
    }

    pub fn get(&self, key: &EntityRef) -> Option<CanonicalEntityState> {
        self.state.lock().snapshots.get(key).cloned()
    }

    pub fn contains(&self, key: &EntityRef) -> bool {
        self.state.lock().snapshots.contains_key(key)
    }

    /// Claims an already-resident snapshot for another pin. Returns false
    /// when no snapshot is resident for the key.
    pub fn add_to_pin(&self, pin: &str, key: &EntityRef) -> Result<bool, StoreError> {
        let added = {
            let mut table = self.state.lock();
            if !table.snapshots.contains_key(key) {
                false
            } else {
                table.pins.entry(pin.to_string()).or_default().insert(key.clone())
            }
        };
        if added {
            self.save()?;
        }
        Ok(added)
    }

    /// Releases one pin's claim on one entity, evicting the snapshot when
    /// its membership count reaches zero.
    pub fn remove_from_pin(&self, pin: &str, key: &EntityRef) -> Result<(), StoreError> {
        {
            let mut table = self.state.lock();
            if let Some(members) = table.pins.get_mut(pin) {
                members.remove(key);
                if members.is_empty() {
                    table.pins.remove(pin);
                }
            }
            table.evict_if_unpinned(key);
        }
        self.save()
    }

    /// Destroys a pin, decrementing membership for every entity it held
    /// and evicting any whose count drops to zero.
    pub fn remove_pin(&self, pin: &str) -> Result<(), StoreError> {
        {
            let mut table = self.state.lock();
            let Some(members) = table.pins.remove(pin) else {
                return Ok(());
            };
            for key in members {
                table.evict_if_unpinned(&key);
            }
        }
        self.save()
    }

    /// Refreshes an already-resident snapshot with the remote's canonical
    /// state. Entities nobody pinned are not retained by acknowledgement
    /// traffic alone.
    pub fn update_canonical(&self, state: &CanonicalEntityState) -> Result<bool, StoreError> {
        let updated = {
            let mut table = self.state.lock();
            if table.snapshots.contains_key(&state.entity) {
                table.snapshots.insert(state.entity.clone(), state.clone());
                true
            } else {
                false
            }
        };
        if updated {
            self.save()?;
            debug!(entity = %state.entity, "pinned snapshot refreshed from canonical state");
        }
        Ok(updated)
    }

    /// Drops an entity outright: snapshot and every pin membership. Used
    /// when the remote confirms the entity no longer exists.
    pub fn remove_entity(&self, key: &EntityRef) -> Result<bool, StoreError> {
        let removed = {
            let mut table = self.state.lock();
            let removed = table.snapshots.remove(key).is_some();
            table.pins.retain(|_, members| {
                members.remove(key);
                !members.is_empty()
            });
            removed
        };
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Evaluates a pinned-source predicate entirely against resident
    /// snapshots.
    pub fn find(&self, predicate: &QueryPredicate) -> Vec<CanonicalEntityState> {
        let table = self.state.lock();
        let scope: Option<&BTreeSet<EntityRef>> = match &predicate.source {
            QuerySource::Pinned { pin: Some(name) } => {
                let Some(members) = table.pins.get(name) else {
                    return Vec::new();
                };
                Some(members)
            }
            _ => None,
        };
        let mut out = Vec::new();
        for (key, snapshot) in &table.snapshots {
            if let Some(members) = scope
                && !members.contains(key)
            {
                continue;
            }
            if predicate.matches(snapshot) {
                out.push(snapshot.clone());
                if predicate.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        out
    }

    pub fn pin_names(&self) -> Vec<String> {
        self.state.lock().pins.keys().cloned().collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    pub fn membership_count(&self, key: &EntityRef) -> usize {
        self.state.lock().membership_count(key)
    }

    fn save(&self) -> Result<(), StoreError> {
        let sync = self.config.sync_writes();
        self.lock.with_exclusive(|| {
            // Snapshot the table inside the exclusive section so a racing
            // save cannot clobber a newer table with an older encoding.
            let bytes = {
                let table = self.state.lock();
                encode_table(&table)?
            };
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            if sync {
                tmp.as_file().sync_all()?;
            }
            tmp.persist(&self.path)
                .map_err(|e| StoreError::IoFailure(e.error))?;
            if sync {
                let dir_file = File::open(&self.dir)?;
                dir_file.sync_all()?;
            }
            Ok(())
        })
    }
}

fn encode_table(table: &PinTable) -> Result<Vec<u8>, StoreError> {
    let payload = rmp_serde::to_vec(table).map_err(|e| StoreError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(8 + payload.len() + 4);
    out.extend_from_slice(&PIN_TABLE_MAGIC.to_be_bytes());
    out.extend_from_slice(&PIN_TABLE_VERSION.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&payload);
    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

fn load_table(path: &Path) -> Result<PinTable, StoreError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 12 {
        return Err(StoreError::Decode("pin table shorter than header".into()));
    }
    let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("slice len"));
    if magic != PIN_TABLE_MAGIC {
        return Err(StoreError::Decode("bad pin table magic".into()));
    }
    let version = u16::from_be_bytes(bytes[4..6].try_into().expect("slice len"));
    if version != PIN_TABLE_VERSION {
        return Err(StoreError::Decode(format!(
            "unsupported pin table version: {version}"
        )));
    }
    let crc_offset = bytes.len() - 4;
    let stored_crc = u32::from_be_bytes(bytes[crc_offset..].try_into().expect("slice len"));
    if stored_crc != crc32c(&bytes[..crc_offset]) {
        return Err(StoreError::Decode("pin table crc mismatch".into()));
    }
    rmp_serde::from_slice(&bytes[8..crc_offset]).map_err(|e| StoreError::Decode(e.to_string()))
}
