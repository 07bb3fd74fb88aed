// SPDX-License-Identifier: MPL-2.0

//! The object hash.
//!
//! Objects named by `(type, OID)` are universally reached through this
//! table. The snapshot flag selects between the current and the snapshot
//! version of an object when both are resident.

use hashbrown::HashMap;
use spin::Mutex;

use crate::{
    obj::{FrameFlags, ObRef, ObType},
    types::Oid,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct Key {
    ty: ObType,
    oid: Oid,
}

pub struct ObHash {
    /// Both versions of an object, current first.
    map: Mutex<HashMap<Key, [Option<ObRef>; 2]>>,
}

impl ObHash {
    pub fn new() -> Self {
        ObHash {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a frame. Its header must carry the final type, OID, and
    /// current/snapshot marking.
    pub fn insert(&self, obref: ObRef, oid: Oid) {
        let mut map = self.map.lock();
        let entry = map.entry(Key { ty: obref.ty, oid }).or_default();
        if entry[0].is_none() {
            entry[0] = Some(obref);
        } else {
            debug_assert!(entry[1].is_none(), "more than two versions of an object");
            entry[1] = Some(obref);
        }
    }

    /// Find the resident version of `(ty, oid)` with the wanted marking.
    pub fn lookup(
        &self,
        cache: &crate::cache::Cache,
        ty: ObType,
        oid: Oid,
        want_snapshot: bool,
    ) -> Option<ObRef> {
        let map = self.map.lock();
        let entry = map.get(&Key { ty, oid })?;
        entry.iter().flatten().copied().find(|&obref| {
            let flags = cache.hdr(obref).meta().flags;
            debug_assert!(flags.intersects(FrameFlags::CURRENT | FrameFlags::SNAPSHOT));
            if want_snapshot {
                flags.contains(FrameFlags::SNAPSHOT)
            } else {
                flags.contains(FrameFlags::CURRENT)
            }
        })
    }

    /// Remove a frame from the hash.
    pub fn remove(&self, obref: ObRef, oid: Oid) {
        let mut map = self.map.lock();
        let key = Key { ty: obref.ty, oid };
        if let Some(entry) = map.get_mut(&key) {
            for v in entry.iter_mut() {
                if *v == Some(obref) {
                    *v = None;
                }
            }
            if entry.iter().all(Option::is_none) {
                map.remove(&key);
            }
        }
    }
}

impl Default for ObHash {
    fn default() -> Self {
        Self::new()
    }
}
