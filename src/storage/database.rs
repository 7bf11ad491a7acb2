//! Black-box row store behind the storage node.
//!
//! The narrow surface mirrors what the rest of the system is allowed to
//! assume: object rows keyed by `(oid, tid)`, transaction rows keyed by tid,
//! a temporary area for unfinished commits, and the persisted partition
//! table revision.

use crate::error::{Error, Result};
use crate::partition::CellChange;
use crate::types::{Checksum, NodeId, Oid, Ptid, Tid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

/// One object revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub oid: Oid,
    pub tid: Tid,
    /// Serial of the next revision, if one exists. Computed on read.
    pub next_tid: Option<Tid>,
    pub compression: bool,
    pub checksum: Checksum,
    pub data: Vec<u8>,
    /// Back-pointer to the revision holding the actual data; used by undo.
    pub data_tid: Option<Tid>,
}

/// Transaction metadata row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub tid: Tid,
    pub oids: Vec<Oid>,
    pub user: String,
    pub description: String,
    pub extension: Vec<u8>,
}

/// Semantic surface of the row store. Implementations are internally
/// synchronized; callers may share one behind an `Arc`.
pub trait Database: Send + Sync {
    /// Fetch one revision. `at_tid` selects an exact serial, `before_tid`
    /// the latest revision strictly older; with neither, the latest.
    /// Back-pointer rows are resolved to the data they reference.
    fn get_object(
        &self,
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    ) -> Result<Option<ObjectRow>>;

    /// `(last_tid, last_ptid, last_oid)` as known by this store.
    fn get_last_ids(&self) -> Result<(Tid, Ptid, Oid)>;

    fn set_last_oid(&self, oid: Oid) -> Result<()>;

    /// Committed TIDs for the given partitions, newest first, sliced by
    /// `[first, last)`. An empty partition list means all partitions.
    fn get_tid_list(
        &self,
        first: u64,
        last: u64,
        partitions: &[u32],
        num_partitions: u32,
    ) -> Result<Vec<Tid>>;

    /// `(tid, size)` revisions of an object, newest first, sliced by
    /// `[first, last)`.
    fn get_object_history(&self, oid: Oid, first: u64, last: u64) -> Result<Vec<(Tid, u32)>>;

    /// Store object rows and optional transaction metadata. With
    /// `temporary`, the rows are parked until [`Database::finish_transaction`]
    /// publishes them or [`Database::delete_transaction`] drops them.
    fn store_transaction(
        &self,
        tid: Tid,
        objects: &[ObjectRow],
        transaction: Option<&TransactionRow>,
        temporary: bool,
    ) -> Result<()>;

    fn finish_transaction(&self, tid: Tid) -> Result<()>;

    fn delete_transaction(&self, tid: Tid) -> Result<()>;

    /// Committed transaction metadata; with `include_unfinished`, temporary
    /// metadata is visible too.
    fn get_transaction(&self, tid: Tid, include_unfinished: bool)
        -> Result<Option<TransactionRow>>;

    fn get_unfinished_tids(&self) -> Result<Vec<Tid>>;

    fn object_present(&self, oid: Oid, tid: Tid) -> Result<bool>;

    fn change_partition_table(&self, ptid: Ptid, changes: &[CellChange]) -> Result<()>;

    fn get_partition_table(&self) -> Result<(Ptid, Vec<CellChange>)>;

    /// Drop object revisions strictly older than `tid`, keeping the latest
    /// revision at or before it for every object.
    fn pack(&self, tid: Tid) -> Result<()>;

    /// Node identity persisted after the primary assigned one.
    fn get_uuid(&self) -> Result<Option<NodeId>>;

    fn set_uuid(&self, id: NodeId) -> Result<()>;
}

fn slice_desc<T: Copy>(items: impl Iterator<Item = T>, first: u64, last: u64) -> Vec<T> {
    items
        .skip(first as usize)
        .take(last.saturating_sub(first) as usize)
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory backend, used by tests and by transient cluster members.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    objects: BTreeMap<(Oid, Tid), StoredObject>,
    transactions: BTreeMap<Tid, TransactionRow>,
    temp_objects: BTreeMap<(Oid, Tid), StoredObject>,
    temp_transactions: BTreeMap<Tid, TransactionRow>,
    last_oid: Oid,
    ptid: Ptid,
    cells: Vec<CellChange>,
    uuid: Option<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredObject {
    compression: bool,
    checksum: Checksum,
    data: Vec<u8>,
    data_tid: Option<Tid>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    inner: Mutex<MemInner>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }
}

impl MemInner {
    fn resolve_row(&self, oid: Oid, tid: Tid, stored: &StoredObject) -> ObjectRow {
        let next_tid = self
            .objects
            .range((oid, tid.next())..=(oid, Tid::new(u64::MAX)))
            .next()
            .map(|((_, t), _)| *t);
        // Follow back-pointers until a row carrying data.
        let mut data = stored.data.clone();
        let mut compression = stored.compression;
        let mut checksum = stored.checksum;
        let mut pointer = stored.data_tid;
        while data.is_empty() {
            let Some(target) = pointer else { break };
            match self.objects.get(&(oid, target)) {
                Some(row) => {
                    data = row.data.clone();
                    compression = row.compression;
                    checksum = row.checksum;
                    pointer = row.data_tid;
                }
                None => break,
            }
        }
        ObjectRow {
            oid,
            tid,
            next_tid,
            compression,
            checksum,
            data,
            data_tid: stored.data_tid,
        }
    }
}

impl Database for MemoryDatabase {
    fn get_object(
        &self,
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    ) -> Result<Option<ObjectRow>> {
        let inner = self.inner.lock().unwrap();
        let found = match (at_tid, before_tid) {
            (Some(at), _) => inner.objects.get_key_value(&(oid, at)),
            (None, Some(before)) => inner
                .objects
                .range((oid, Tid::ZERO)..(oid, before))
                .next_back(),
            (None, None) => inner
                .objects
                .range((oid, Tid::ZERO)..=(oid, Tid::new(u64::MAX)))
                .next_back(),
        };
        Ok(found.map(|((_, tid), stored)| inner.resolve_row(oid, *tid, stored)))
    }

    fn get_last_ids(&self) -> Result<(Tid, Ptid, Oid)> {
        let inner = self.inner.lock().unwrap();
        let last_tid = inner
            .transactions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Tid::ZERO);
        Ok((last_tid, inner.ptid, inner.last_oid))
    }

    fn set_last_oid(&self, oid: Oid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if oid > inner.last_oid {
            inner.last_oid = oid;
        }
        Ok(())
    }

    fn get_tid_list(
        &self,
        first: u64,
        last: u64,
        partitions: &[u32],
        num_partitions: u32,
    ) -> Result<Vec<Tid>> {
        let inner = self.inner.lock().unwrap();
        Ok(slice_desc(
            inner.transactions.keys().rev().copied().filter(|tid| {
                partitions.is_empty()
                    || partitions.contains(&((tid.raw() % num_partitions as u64) as u32))
            }),
            first,
            last,
        ))
    }

    fn get_object_history(&self, oid: Oid, first: u64, last: u64) -> Result<Vec<(Tid, u32)>> {
        let inner = self.inner.lock().unwrap();
        Ok(slice_desc(
            inner
                .objects
                .range((oid, Tid::ZERO)..=(oid, Tid::new(u64::MAX)))
                .rev()
                .map(|((_, tid), stored)| (*tid, stored.data.len() as u32)),
            first,
            last,
        ))
    }

    fn store_transaction(
        &self,
        tid: Tid,
        objects: &[ObjectRow],
        transaction: Option<&TransactionRow>,
        temporary: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for row in objects {
            let stored = StoredObject {
                compression: row.compression,
                checksum: row.checksum,
                data: row.data.clone(),
                data_tid: row.data_tid,
            };
            if temporary {
                inner.temp_objects.insert((row.oid, tid), stored);
            } else {
                inner.objects.insert((row.oid, tid), stored);
            }
        }
        if let Some(row) = transaction {
            if temporary {
                inner.temp_transactions.insert(tid, row.clone());
            } else {
                inner.transactions.insert(tid, row.clone());
            }
        }
        Ok(())
    }

    fn finish_transaction(&self, tid: Tid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(Oid, Tid)> = inner
            .temp_objects
            .keys()
            .filter(|(_, t)| *t == tid)
            .copied()
            .collect();
        for key in keys {
            if let Some(stored) = inner.temp_objects.remove(&key) {
                inner.objects.insert(key, stored);
            }
        }
        if let Some(row) = inner.temp_transactions.remove(&tid) {
            inner.transactions.insert(tid, row);
        }
        Ok(())
    }

    fn delete_transaction(&self, tid: Tid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.temp_objects.retain(|(_, t), _| *t != tid);
        inner.temp_transactions.remove(&tid);
        Ok(())
    }

    fn get_transaction(
        &self,
        tid: Tid,
        include_unfinished: bool,
    ) -> Result<Option<TransactionRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.transactions.get(&tid).cloned().or_else(|| {
            if include_unfinished {
                inner.temp_transactions.get(&tid).cloned()
            } else {
                None
            }
        }))
    }

    fn get_unfinished_tids(&self) -> Result<Vec<Tid>> {
        let inner = self.inner.lock().unwrap();
        let mut tids: BTreeSet<Tid> = inner.temp_transactions.keys().copied().collect();
        tids.extend(inner.temp_objects.keys().map(|(_, tid)| *tid));
        Ok(tids.into_iter().collect())
    }

    fn object_present(&self, oid: Oid, tid: Tid) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.objects.contains_key(&(oid, tid))
            || inner.temp_objects.contains_key(&(oid, tid)))
    }

    fn change_partition_table(&self, ptid: Ptid, changes: &[CellChange]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ptid = ptid;
        for change in changes {
            inner
                .cells
                .retain(|c| !(c.partition == change.partition && c.node == change.node));
            inner.cells.push(*change);
        }
        Ok(())
    }

    fn get_partition_table(&self) -> Result<(Ptid, Vec<CellChange>)> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.ptid, inner.cells.clone()))
    }

    fn pack(&self, tid: Tid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let oids: BTreeSet<Oid> = inner.objects.keys().map(|(oid, _)| *oid).collect();
        for oid in oids {
            let keep: Option<Tid> = inner
                .objects
                .range((oid, Tid::ZERO)..(oid, tid))
                .next_back()
                .map(|((_, t), _)| *t);
            if let Some(keep) = keep {
                let drop_keys: Vec<(Oid, Tid)> = inner
                    .objects
                    .range((oid, Tid::ZERO)..(oid, keep))
                    .map(|(k, _)| *k)
                    .collect();
                for key in drop_keys {
                    inner.objects.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn get_uuid(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.lock().unwrap().uuid)
    }

    fn set_uuid(&self, id: NodeId) -> Result<()> {
        self.inner.lock().unwrap().uuid = Some(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sled backend: the persistent store for real deployments.
// ---------------------------------------------------------------------------

/// Object rows live in `obj` under `oid ++ tid` (big-endian, so range scans
/// walk revisions in serial order); transaction rows in `trans` under `tid`.
/// Unfinished commits park in `tobj` / `ttrans` until finished or deleted.
pub struct SledDatabase {
    _db: sled::Db,
    obj: sled::Tree,
    trans: sled::Tree,
    tobj: sled::Tree,
    ttrans: sled::Tree,
    meta: sled::Tree,
}

fn obj_key(oid: Oid, tid: Tid) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&oid.to_bytes());
    key[8..].copy_from_slice(&tid.to_bytes());
    key
}

impl SledDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SledDatabase> {
        let db = sled::open(path)?;
        Ok(SledDatabase {
            obj: db.open_tree("obj")?,
            trans: db.open_tree("trans")?,
            tobj: db.open_tree("tobj")?,
            ttrans: db.open_tree("ttrans")?,
            meta: db.open_tree("meta")?,
            _db: db,
        })
    }

    fn stored_at(&self, oid: Oid, tid: Tid) -> Result<Option<StoredObject>> {
        Ok(self
            .obj
            .get(obj_key(oid, tid))?
            .map(|v| bincode::deserialize(&v))
            .transpose()?)
    }

    /// Latest `(tid, row)` for `oid` strictly below `before`.
    fn latest_below(&self, oid: Oid, before: Tid) -> Result<Option<(Tid, StoredObject)>> {
        let found = self
            .obj
            .range(obj_key(oid, Tid::ZERO)..obj_key(oid, before))
            .next_back();
        match found {
            Some(entry) => {
                let (key, value) = entry?;
                let tid = Tid::from_bytes(key[8..16].try_into().unwrap());
                Ok(Some((tid, bincode::deserialize(&value)?)))
            }
            None => Ok(None),
        }
    }

    fn next_serial(&self, oid: Oid, tid: Tid) -> Result<Option<Tid>> {
        let found = self
            .obj
            .range(obj_key(oid, tid.next())..obj_key(oid.next(), Tid::ZERO))
            .next();
        match found {
            Some(entry) => {
                let (key, _) = entry?;
                Ok(Some(Tid::from_bytes(key[8..16].try_into().unwrap())))
            }
            None => Ok(None),
        }
    }

    fn resolve_row(&self, oid: Oid, tid: Tid, stored: StoredObject) -> Result<ObjectRow> {
        let next_tid = self.next_serial(oid, tid)?;
        let mut data = stored.data.clone();
        let mut compression = stored.compression;
        let mut checksum = stored.checksum;
        let mut pointer = stored.data_tid;
        while data.is_empty() {
            let Some(target) = pointer else { break };
            match self.stored_at(oid, target)? {
                Some(row) => {
                    data = row.data;
                    compression = row.compression;
                    checksum = row.checksum;
                    pointer = row.data_tid;
                }
                None => break,
            }
        }
        Ok(ObjectRow {
            oid,
            tid,
            next_tid,
            compression,
            checksum,
            data,
            data_tid: stored.data_tid,
        })
    }
}

impl Database for SledDatabase {
    fn get_object(
        &self,
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    ) -> Result<Option<ObjectRow>> {
        let found = match (at_tid, before_tid) {
            (Some(at), _) => self.stored_at(oid, at)?.map(|stored| (at, stored)),
            (None, Some(before)) => self.latest_below(oid, before)?,
            (None, None) => self.latest_below(oid, Tid::new(u64::MAX))?,
        };
        match found {
            Some((tid, stored)) => Ok(Some(self.resolve_row(oid, tid, stored)?)),
            None => Ok(None),
        }
    }

    fn get_last_ids(&self) -> Result<(Tid, Ptid, Oid)> {
        let last_tid = match self.trans.last()? {
            Some((key, _)) => Tid::from_bytes(key[..8].try_into().unwrap()),
            None => Tid::ZERO,
        };
        let ptid = match self.meta.get("ptid")? {
            Some(v) => Ptid::from_bytes(v[..8].try_into().unwrap()),
            None => Ptid::ZERO,
        };
        let last_oid = match self.meta.get("last_oid")? {
            Some(v) => Oid::from_bytes(v[..8].try_into().unwrap()),
            None => Oid::ZERO,
        };
        Ok((last_tid, ptid, last_oid))
    }

    fn set_last_oid(&self, oid: Oid) -> Result<()> {
        let (_, _, current) = self.get_last_ids()?;
        if oid > current {
            self.meta.insert("last_oid", &oid.to_bytes())?;
        }
        Ok(())
    }

    fn get_tid_list(
        &self,
        first: u64,
        last: u64,
        partitions: &[u32],
        num_partitions: u32,
    ) -> Result<Vec<Tid>> {
        let mut tids = Vec::new();
        for entry in self.trans.iter().rev() {
            let (key, _) = entry?;
            let tid = Tid::from_bytes(key[..8].try_into().unwrap());
            if partitions.is_empty()
                || partitions.contains(&((tid.raw() % num_partitions as u64) as u32))
            {
                tids.push(tid);
            }
        }
        Ok(slice_desc(tids.into_iter(), first, last))
    }

    fn get_object_history(&self, oid: Oid, first: u64, last: u64) -> Result<Vec<(Tid, u32)>> {
        let mut history = Vec::new();
        for entry in self
            .obj
            .range(obj_key(oid, Tid::ZERO)..obj_key(oid.next(), Tid::ZERO))
            .rev()
        {
            let (key, value) = entry?;
            let tid = Tid::from_bytes(key[8..16].try_into().unwrap());
            let stored: StoredObject = bincode::deserialize(&value)?;
            history.push((tid, stored.data.len() as u32));
        }
        Ok(slice_desc(history.into_iter(), first, last))
    }

    fn store_transaction(
        &self,
        tid: Tid,
        objects: &[ObjectRow],
        transaction: Option<&TransactionRow>,
        temporary: bool,
    ) -> Result<()> {
        let obj_tree = if temporary { &self.tobj } else { &self.obj };
        for row in objects {
            let stored = StoredObject {
                compression: row.compression,
                checksum: row.checksum,
                data: row.data.clone(),
                data_tid: row.data_tid,
            };
            obj_tree.insert(obj_key(row.oid, tid), bincode::serialize(&stored)?)?;
        }
        if let Some(row) = transaction {
            let tree = if temporary { &self.ttrans } else { &self.trans };
            tree.insert(tid.to_bytes(), bincode::serialize(row)?)?;
        }
        Ok(())
    }

    fn finish_transaction(&self, tid: Tid) -> Result<()> {
        let mut moved = Vec::new();
        for entry in self.tobj.iter() {
            let (key, value) = entry?;
            if Tid::from_bytes(key[8..16].try_into().unwrap()) == tid {
                moved.push((key, value));
            }
        }
        for (key, value) in moved {
            self.obj.insert(&key, value)?;
            self.tobj.remove(&key)?;
        }
        if let Some(row) = self.ttrans.remove(tid.to_bytes())? {
            self.trans.insert(tid.to_bytes(), row)?;
        }
        Ok(())
    }

    fn delete_transaction(&self, tid: Tid) -> Result<()> {
        let mut dropped = Vec::new();
        for entry in self.tobj.iter() {
            let (key, _) = entry?;
            if Tid::from_bytes(key[8..16].try_into().unwrap()) == tid {
                dropped.push(key);
            }
        }
        for key in dropped {
            self.tobj.remove(&key)?;
        }
        self.ttrans.remove(tid.to_bytes())?;
        Ok(())
    }

    fn get_transaction(
        &self,
        tid: Tid,
        include_unfinished: bool,
    ) -> Result<Option<TransactionRow>> {
        if let Some(v) = self.trans.get(tid.to_bytes())? {
            return Ok(Some(bincode::deserialize(&v)?));
        }
        if include_unfinished {
            if let Some(v) = self.ttrans.get(tid.to_bytes())? {
                return Ok(Some(bincode::deserialize(&v)?));
            }
        }
        Ok(None)
    }

    fn get_unfinished_tids(&self) -> Result<Vec<Tid>> {
        let mut tids = BTreeSet::new();
        for entry in self.ttrans.iter() {
            let (key, _) = entry?;
            tids.insert(Tid::from_bytes(key[..8].try_into().unwrap()));
        }
        for entry in self.tobj.iter() {
            let (key, _) = entry?;
            tids.insert(Tid::from_bytes(key[8..16].try_into().unwrap()));
        }
        Ok(tids.into_iter().collect())
    }

    fn object_present(&self, oid: Oid, tid: Tid) -> Result<bool> {
        Ok(self.obj.contains_key(obj_key(oid, tid))?
            || self.tobj.contains_key(obj_key(oid, tid))?)
    }

    fn change_partition_table(&self, ptid: Ptid, changes: &[CellChange]) -> Result<()> {
        self.meta.insert("ptid", &ptid.to_bytes())?;
        let (_, mut cells) = self.get_partition_table()?;
        for change in changes {
            cells.retain(|c| !(c.partition == change.partition && c.node == change.node));
            cells.push(*change);
        }
        self.meta.insert("pt", bincode::serialize(&cells)?)?;
        Ok(())
    }

    fn get_partition_table(&self) -> Result<(Ptid, Vec<CellChange>)> {
        let ptid = match self.meta.get("ptid")? {
            Some(v) => Ptid::from_bytes(v[..8].try_into().unwrap()),
            None => Ptid::ZERO,
        };
        let cells = match self.meta.get("pt")? {
            Some(v) => bincode::deserialize(&v)?,
            None => Vec::new(),
        };
        Ok((ptid, cells))
    }

    fn pack(&self, tid: Tid) -> Result<()> {
        let mut oids = BTreeSet::new();
        for entry in self.obj.iter() {
            let (key, _) = entry?;
            oids.insert(Oid::from_bytes(key[..8].try_into().unwrap()));
        }
        for oid in oids {
            let keep = match self.latest_below(oid, tid)? {
                Some((keep, _)) => keep,
                None => continue,
            };
            let mut drop_keys = Vec::new();
            for entry in self.obj.range(obj_key(oid, Tid::ZERO)..obj_key(oid, keep)) {
                let (key, _) = entry?;
                drop_keys.push(key);
            }
            for key in drop_keys {
                self.obj.remove(&key)?;
            }
        }
        Ok(())
    }

    fn get_uuid(&self) -> Result<Option<NodeId>> {
        Ok(self
            .meta
            .get("uuid")?
            .map(|v| NodeId::from_bytes(v[..8].try_into().unwrap())))
    }

    fn set_uuid(&self, id: NodeId) -> Result<()> {
        self.meta.insert("uuid", &id.to_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for SledDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SledDatabase")
    }
}

/// Quick guard used by handlers that must refuse writes on unknown serials.
pub fn serial_mismatch(current: Option<&ObjectRow>, base_serial: Tid) -> Option<Tid> {
    match current {
        Some(row) if row.tid != base_serial => Some(row.tid),
        None if !base_serial.is_zero() => Some(Tid::ZERO),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(oid: u64, data: &[u8], data_tid: Option<Tid>) -> ObjectRow {
        ObjectRow {
            oid: Oid::new(oid),
            tid: Tid::ZERO,
            next_tid: None,
            compression: false,
            checksum: Checksum::of(data),
            data: data.to_vec(),
            data_tid,
        }
    }

    fn txn_row(tid: Tid, oids: Vec<Oid>) -> TransactionRow {
        TransactionRow {
            tid,
            oids,
            user: "user".into(),
            description: String::new(),
            extension: Vec::new(),
        }
    }

    fn exercise(db: &dyn Database) {
        let oid = Oid::new(1);
        let t1 = Tid::new(10);
        let t2 = Tid::new(20);

        db.store_transaction(t1, &[row(1, b"one", None)], Some(&txn_row(t1, vec![oid])), true)
            .unwrap();
        assert_eq!(db.get_unfinished_tids().unwrap(), vec![t1]);
        assert!(db.get_object(oid, None, None).unwrap().is_none());

        db.finish_transaction(t1).unwrap();
        assert!(db.get_unfinished_tids().unwrap().is_empty());
        let fetched = db.get_object(oid, None, None).unwrap().unwrap();
        assert_eq!(fetched.tid, t1);
        assert_eq!(fetched.data, b"one");
        assert_eq!(fetched.next_tid, None);

        db.store_transaction(t2, &[row(1, b"two", None)], Some(&txn_row(t2, vec![oid])), true)
            .unwrap();
        db.finish_transaction(t2).unwrap();

        // Latest, exact, and before lookups.
        assert_eq!(db.get_object(oid, None, None).unwrap().unwrap().tid, t2);
        let at_t1 = db.get_object(oid, Some(t1), None).unwrap().unwrap();
        assert_eq!(at_t1.data, b"one");
        assert_eq!(at_t1.next_tid, Some(t2));
        let before_t2 = db.get_object(oid, None, Some(t2)).unwrap().unwrap();
        assert_eq!(before_t2.tid, t1);

        let (last_tid, _, _) = db.get_last_ids().unwrap();
        assert_eq!(last_tid, t2);
        assert_eq!(db.get_tid_list(0, 10, &[], 1).unwrap(), vec![t2, t1]);
        assert_eq!(
            db.get_object_history(oid, 0, 10).unwrap(),
            vec![(t2, 3), (t1, 3)]
        );

        // Aborted commits leave no trace.
        let t3 = Tid::new(30);
        db.store_transaction(t3, &[row(1, b"three", None)], None, true)
            .unwrap();
        db.delete_transaction(t3).unwrap();
        assert!(db.get_unfinished_tids().unwrap().is_empty());
        assert_eq!(db.get_object(oid, None, None).unwrap().unwrap().tid, t2);

        // Back-pointer rows resolve to the referenced data.
        let t4 = Tid::new(40);
        db.store_transaction(t4, &[row(1, b"", Some(t1))], Some(&txn_row(t4, vec![oid])), false)
            .unwrap();
        let resolved = db.get_object(oid, None, None).unwrap().unwrap();
        assert_eq!(resolved.tid, t4);
        assert_eq!(resolved.data, b"one");
        assert_eq!(resolved.data_tid, Some(t1));

        // Pack keeps the latest revision below the pack point.
        db.pack(Tid::new(25)).unwrap();
        assert!(db.get_object(oid, Some(t1), None).unwrap().is_none());
        assert!(db.get_object(oid, Some(t2), None).unwrap().is_some());
    }

    #[test]
    fn memory_database_semantics() {
        exercise(&MemoryDatabase::new());
    }

    #[test]
    fn sled_database_semantics() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&SledDatabase::open(dir.path()).unwrap());
    }

    #[test]
    fn sled_partition_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let change = CellChange {
            partition: 0,
            node: crate::types::NodeId::new(5),
            state: crate::types::CellState::UpToDate,
        };
        {
            let db = SledDatabase::open(dir.path()).unwrap();
            db.change_partition_table(Ptid::new(3), &[change]).unwrap();
        }
        let db = SledDatabase::open(dir.path()).unwrap();
        let (ptid, cells) = db.get_partition_table().unwrap();
        assert_eq!(ptid, Ptid::new(3));
        assert_eq!(cells, vec![change]);
    }

    #[test]
    fn serial_mismatch_reports_conflicts() {
        let current = ObjectRow {
            oid: Oid::new(1),
            tid: Tid::new(5),
            next_tid: None,
            compression: false,
            checksum: Checksum::of(b"x"),
            data: b"x".to_vec(),
            data_tid: None,
        };
        assert_eq!(serial_mismatch(Some(&current), Tid::new(5)), None);
        assert_eq!(
            serial_mismatch(Some(&current), Tid::new(3)),
            Some(Tid::new(5))
        );
        assert_eq!(serial_mismatch(None, Tid::ZERO), None);
    }
}
