//! The in-memory database: keyed collections, hook registry, expirations,
//! and the durability log state, all protected by one reader/writer lock
//! owned by the server.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use meridian_collection::Collection;
use meridian_geo::Object;

use crate::aof::Aof;
use crate::config::Config;
use crate::expire::ExpireIndex;
use crate::hook::Hook;

/// Mutation record produced by every successful write. Fans out to the
/// log, the live dispatcher, and the fence evaluator.
#[derive(Debug, Clone)]
pub struct CommandDetails {
    /// "set", "fset", "del", "drop", or "flushdb".
    pub command: String,
    pub key: String,
    pub id: String,
    pub obj: Option<Object>,
    pub fields: Vec<f64>,
    pub old_obj: Option<Object>,
    pub old_fields: Vec<f64>,
    /// Field-slot table snapshot for message formatting.
    pub field_map: HashMap<String, usize>,
    /// FSET only: whether the numeric value changed.
    pub updated: bool,
    pub timestamp: DateTime<Utc>,
}

impl CommandDetails {
    pub fn new(command: &str, key: &str, id: &str) -> CommandDetails {
        CommandDetails {
            command: command.to_string(),
            key: key.to_string(),
            id: id.to_string(),
            obj: None,
            fields: Vec::new(),
            old_obj: None,
            old_fields: Vec::new(),
            field_map: HashMap::new(),
            updated: false,
            timestamp: Utc::now(),
        }
    }
}

/// Inverse of a mutation, applied when synchronous hook delivery fails
/// after the in-memory change already happened.
#[derive(Debug)]
pub enum Undo {
    /// SET of a previously-absent id.
    Unset { key: String, id: String },
    /// SET/FSET over existing state: restore the prior object and the
    /// named field values.
    Reinsert {
        key: String,
        id: String,
        object: Object,
        fields: Vec<(String, f64)>,
    },
    /// DEL: put the removed item back.
    Restore {
        key: String,
        id: String,
        object: Object,
        fields: Vec<(String, f64)>,
    },
    /// DROP/FLUSHDB are not reverted.
    None,
}

/// The shared database state.
pub struct Db {
    pub dir: PathBuf,
    pub collections: BTreeMap<String, Collection>,
    pub hooks: HashMap<String, Arc<Hook>>,
    pub hooks_by_key: HashMap<String, HashMap<String, Arc<Hook>>>,
    pub expires: ExpireIndex,
    pub config: Config,
    pub aof: Aof,
    /// Follower state: reads are refused until the log catches up.
    pub caught_up: bool,
    /// Bumped whenever the follow target changes; stale follower loops
    /// notice and abort.
    pub followc: u64,
    /// Fence group id allocator; atomic so the evaluator can allocate
    /// under a read guard.
    group_counter: std::sync::atomic::AtomicU64,
    pub dev_mode: bool,
    /// Deliver hooks inline before the log append instead of off the
    /// mutation queue.
    pub hook_sync: bool,
}

impl Db {
    pub fn new(dir: PathBuf, config: Config, aof: Aof) -> Db {
        Db {
            dir,
            collections: BTreeMap::new(),
            hooks: HashMap::new(),
            hooks_by_key: HashMap::new(),
            expires: ExpireIndex::default(),
            config,
            aof,
            caught_up: true,
            followc: 0,
            group_counter: std::sync::atomic::AtomicU64::new(0),
            dev_mode: false,
            hook_sync: false,
        }
    }

    pub fn get_col(&self, key: &str) -> Option<&Collection> {
        self.collections.get(key)
    }

    pub fn get_col_mut(&mut self, key: &str) -> Option<&mut Collection> {
        self.collections.get_mut(key)
    }

    pub fn get_or_create_col(&mut self, key: &str) -> &mut Collection {
        self.collections
            .entry(key.to_string())
            .or_insert_with(Collection::new)
    }

    pub fn delete_col(&mut self, key: &str) -> Option<Collection> {
        self.collections.remove(key)
    }

    /// Summed approximate memory cost of every collection.
    pub fn memory_used(&self) -> u64 {
        self.collections
            .values()
            .map(|c| c.total_weight() as u64)
            .sum()
    }

    /// Whether a SET must be refused for exceeding maxmemory.
    pub fn out_of_memory(&self) -> bool {
        let budget = self.config.maxmemory_bytes();
        budget > 0 && self.memory_used() > budget
    }

    /// Allocate a fresh fence group id.
    pub fn next_group(&self) -> u64 {
        self.group_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1
    }

    /// Install a hook, replacing any prior hook with the same name.
    pub fn install_hook(&mut self, hook: Arc<Hook>) {
        self.uninstall_hook(&hook.name);
        self.hooks_by_key
            .entry(hook.key.clone())
            .or_default()
            .insert(hook.name.clone(), hook.clone());
        self.hooks.insert(hook.name.clone(), hook);
    }

    /// Remove a hook by name; drops the per-key entry when it was the
    /// last hook on that key.
    pub fn uninstall_hook(&mut self, name: &str) -> bool {
        let Some(prev) = self.hooks.remove(name) else {
            return false;
        };
        if let Some(by_key) = self.hooks_by_key.get_mut(&prev.key) {
            by_key.remove(name);
            if by_key.is_empty() {
                self.hooks_by_key.remove(&prev.key);
            }
        }
        true
    }

    /// Hooks interested in mutations of `key`.
    pub fn hooks_for_key(&self, key: &str) -> Vec<Arc<Hook>> {
        self.hooks_by_key
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply an [`Undo`], restoring pre-mutation state.
    pub fn apply_undo(&mut self, undo: Undo) {
        match undo {
            Undo::Unset { key, id } => {
                if let Some(col) = self.get_col_mut(&key) {
                    col.remove(&id);
                    if col.count() == 0 {
                        self.delete_col(&key);
                    }
                }
            }
            Undo::Reinsert {
                key,
                id,
                object,
                fields,
            }
            | Undo::Restore {
                key,
                id,
                object,
                fields,
            } => {
                let col = self.get_or_create_col(&key);
                col.upsert(&id, object, &fields);
            }
            Undo::None => {}
        }
    }
}

/// Pair NaN-free field values with their names, for undo records and
/// shrink rewrites.
pub fn named_fields(field_map: &HashMap<String, usize>, fields: &[f64]) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    for (name, &idx) in field_map {
        if let Some(&v) = fields.get(idx) {
            if !v.is_nan() {
                out.push((name.clone(), v));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Hook;
    use meridian_geo::GeoPoint;

    fn test_db() -> Db {
        let dir = std::env::temp_dir();
        Db::new(dir.clone(), Config::default(), Aof::detached())
    }

    #[test]
    fn hook_registry_by_key() {
        let mut db = test_db();
        let h = Arc::new(Hook::for_tests("h1", "fleet"));
        db.install_hook(h);
        assert_eq!(db.hooks_for_key("fleet").len(), 1);
        assert!(db.hooks_for_key("other").is_empty());

        // Replacing under the same name keeps one entry.
        let h2 = Arc::new(Hook::for_tests("h1", "cars"));
        db.install_hook(h2);
        assert!(db.hooks_for_key("fleet").is_empty());
        assert_eq!(db.hooks_for_key("cars").len(), 1);

        assert!(db.uninstall_hook("h1"));
        assert!(!db.uninstall_hook("h1"));
        assert!(db.hooks_by_key.is_empty());
    }

    #[test]
    fn undo_reverses_set() {
        let mut db = test_db();
        let obj = Object::Point(GeoPoint::new(1.0, 2.0));
        db.get_or_create_col("k").upsert("id", obj, &[]);
        db.apply_undo(Undo::Unset {
            key: "k".into(),
            id: "id".into(),
        });
        assert!(db.get_col("k").is_none());
    }

    #[test]
    fn named_fields_skips_nan() {
        let mut fmap = HashMap::new();
        fmap.insert("a".to_string(), 0);
        fmap.insert("b".to_string(), 1);
        let named = named_fields(&fmap, &[f64::NAN, 7.0]);
        assert_eq!(named, vec![("b".to_string(), 7.0)]);
    }
}
