//! # Anchor & Lock Stores
//!
//! In-memory deserialize caches over the metadata blobs persisted on each
//! stroke object. Parsing happens once per blob revision; every write
//! goes back through the blob immediately (the blob is what the host
//! saves with the project), then refreshes the cache.
//!
//! The lock store also performs the one-shot migration of legacy
//! layer-level lock data found in old anchors blobs.

use std::collections::HashMap;

use onionskin_data::{AnchorTable, LockTable, StrokeObject};

/// Cache of parsed [`AnchorTable`]s, keyed by object name and blob
/// revision.
#[derive(Debug, Default)]
pub struct AnchorStore {
    cache: HashMap<String, (u64, AnchorTable)>,
}

impl AnchorStore {
    /// The parsed table for `obj`, reparsing when the blob changed.
    pub fn table<'a>(&'a mut self, obj: &StrokeObject) -> &'a AnchorTable {
        let stale = self
            .cache
            .get(&obj.name)
            .map(|(rev, _)| *rev != obj.metadata.revision)
            .unwrap_or(true);
        if stale {
            let table = obj
                .metadata
                .anchors_json
                .as_deref()
                .map(AnchorTable::parse)
                .unwrap_or_default();
            self.cache
                .insert(obj.name.clone(), (obj.metadata.revision, table));
        }
        &self.cache[&obj.name].1
    }

    /// Mutate the table and persist it back onto the object.
    pub fn update(&mut self, obj: &mut StrokeObject, mutate: impl FnOnce(&mut AnchorTable)) {
        let mut table = self.table(obj).clone();
        mutate(&mut table);
        obj.metadata.anchors_json = Some(table.to_json());
        obj.metadata.bump();
        self.cache
            .insert(obj.name.clone(), (obj.metadata.revision, table));
    }

    pub fn forget(&mut self, object: &str) {
        self.cache.remove(object);
    }
}

/// Cache of parsed [`LockTable`]s, keyed like [`AnchorStore`].
#[derive(Debug, Default)]
pub struct LockStore {
    cache: HashMap<String, (u64, LockTable)>,
}

impl LockStore {
    /// The parsed table for `obj`. When no lock blob exists yet, legacy
    /// lock data embedded in the anchors blob is read instead (without
    /// writing anything back; see [`LockStore::migrate_legacy`]).
    pub fn table<'a>(&'a mut self, obj: &StrokeObject) -> &'a LockTable {
        let stale = self
            .cache
            .get(&obj.name)
            .map(|(rev, _)| *rev != obj.metadata.revision)
            .unwrap_or(true);
        if stale {
            let table = Self::parse_from(obj);
            self.cache
                .insert(obj.name.clone(), (obj.metadata.revision, table));
        }
        &self.cache[&obj.name].1
    }

    fn parse_from(obj: &StrokeObject) -> LockTable {
        match obj.metadata.locks_json.as_deref() {
            Some(json) => LockTable::parse(json),
            None => obj
                .metadata
                .anchors_json
                .as_deref()
                .and_then(LockTable::from_legacy_anchors)
                .unwrap_or_default(),
        }
    }

    /// Persist the legacy migration: called from contexts where writing
    /// to the object is allowed. No-op once a lock blob exists.
    pub fn migrate_legacy(&mut self, obj: &mut StrokeObject) {
        if obj.metadata.locks_json.is_some() {
            return;
        }
        let Some(table) = obj
            .metadata
            .anchors_json
            .as_deref()
            .and_then(LockTable::from_legacy_anchors)
        else {
            return;
        };
        obj.metadata.locks_json = Some(table.to_json());
        obj.metadata.bump();
        self.cache
            .insert(obj.name.clone(), (obj.metadata.revision, table));
    }

    /// Mutate the table and persist it back onto the object.
    pub fn update(&mut self, obj: &mut StrokeObject, mutate: impl FnOnce(&mut LockTable)) {
        let mut table = self.table(obj).clone();
        mutate(&mut table);
        obj.metadata.locks_json = Some(table.to_json());
        obj.metadata.bump();
        self.cache
            .insert(obj.name.clone(), (obj.metadata.revision, table));
    }

    pub fn forget(&mut self, object: &str) {
        self.cache.remove(object);
    }
}
