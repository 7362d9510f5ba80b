//! Disk assistant
//!
//! Spills payloads into append-only block files, one directory per
//! partition (record type) and one file per insert batch. See
//! [`geocache_storage::format`] for the byte layout.
//!
//! A per-file ledger counts the records still referenced by live entries.
//! Every attached reference is released exactly once: either through
//! [`BackendAssistant::remove_elements`] when its entry is removed, or right
//! after the write when the entry was removed while the spill was in flight.
//! A file whose count reaches zero is deleted.

use geocache_core::{Error, PartSet, Payload, RecordId, Result, TypeKey};
use geocache_storage::format::{decode_record, encode_record, BlockLayout, BlockReader, BlockWriter, ReadRequest};
use geocache_storage::{CacheEntry, DiskRef, SharedCipher, StoreRef};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    fan_out_retrieve, submit_or_run, BackendAssistant, BackendContext, DirectAccessRetriever,
    GroupFetcher, RetrieveRequest, RetrieveUpdate, Retrieved,
};
use crate::background::TaskPriority;

/// Block files of one cache session
pub struct DiskStore {
    layout: BlockLayout,
    cipher: Option<SharedCipher>,
    /// Next file id per partition
    next_file: Mutex<FxHashMap<u32, u32>>,
    /// Live records per (partition, file)
    ledger: Mutex<FxHashMap<(u32, u32), usize>>,
    /// Partitions of removed types; late spills into them are discarded
    retired: Mutex<FxHashSet<u32>>,
}

impl DiskStore {
    /// Open a fresh session under `root`, clearing stale ones
    pub fn open(root: &Path, cipher: Option<SharedCipher>) -> Result<Self> {
        let layout = BlockLayout::open(root)?;
        info!(
            target: "geocache::disk",
            dir = %layout.session_dir().display(),
            encrypted = cipher.is_some(),
            "Disk store opened"
        );
        Ok(Self {
            layout,
            cipher,
            next_file: Mutex::new(FxHashMap::default()),
            ledger: Mutex::new(FxHashMap::default()),
            retired: Mutex::new(FxHashSet::default()),
        })
    }

    /// Directory layout of this session
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Whether metadata and geometry are ciphered
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Reserve the next file id of a partition
    pub fn next_file_id(&self, partition: u32) -> u32 {
        let mut next = self.next_file.lock();
        let slot = next.entry(partition).or_insert(0);
        let file = *slot;
        *slot += 1;
        file
    }

    /// Write one batch into a new block file
    ///
    /// Returns the batch index and reference of every record written.
    /// Records that are already removed, hold no payload or fail to encode
    /// are skipped (the latter with a warning) and stay unspilled. A file
    /// that ends up empty is deleted again.
    pub fn write_batch(
        &self,
        partition: u32,
        file: u32,
        batch: &[(RecordId, Arc<CacheEntry>)],
    ) -> Result<Vec<(usize, DiskRef)>> {
        self.layout.ensure_partition(partition)?;
        let mut writer = BlockWriter::create(&self.layout.file_path(partition, file))?;
        let mut written = Vec::with_capacity(batch.len());
        let outcome = self
            .append_records(&mut writer, partition, file, batch, &mut written)
            .and_then(|()| writer.finish());
        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                // The file never made it into the ledger
                if let Err(cleanup) = self.layout.remove_file(partition, file) {
                    warn!(target: "geocache::disk", partition, file, error = %cleanup, "Failed to delete partial block file");
                }
                return Err(e.into());
            }
        };

        if written.is_empty() {
            self.layout.remove_file(partition, file)?;
        } else {
            self.ledger.lock().insert((partition, file), written.len());
            debug!(
                target: "geocache::disk",
                partition,
                file,
                records = written.len(),
                bytes,
                "Wrote block file"
            );
        }
        Ok(written)
    }

    fn append_records(
        &self,
        writer: &mut BlockWriter,
        partition: u32,
        file: u32,
        batch: &[(RecordId, Arc<CacheEntry>)],
        written: &mut Vec<(usize, DiskRef)>,
    ) -> io::Result<()> {
        let cipher = self.cipher.as_deref();
        for (idx, (id, entry)) in batch.iter().enumerate() {
            if entry.is_retired() {
                continue;
            }
            let Some(payload) = entry.payload() else {
                continue;
            };
            let encoded = match encode_record(&payload, cipher) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(target: "geocache::disk", id = %id, error = %e, "Failed to encode record, it stays resident");
                    continue;
                }
            };
            let disk_ref = match DiskRef::new(partition, file, writer.position(), encoded.lengths) {
                Ok(r) => r,
                Err(e) => {
                    warn!(target: "geocache::disk", id = %id, error = %e, "Record cannot be referenced, it stays resident");
                    continue;
                }
            };
            writer.append(&encoded.bytes)?;
            written.push((idx, disk_ref));
        }
        Ok(())
    }

    /// Read the requested parts of several records of one file
    ///
    /// Reads are coalesced into one pass ordered by position. The result
    /// vector matches `requests` index by index.
    pub fn read_records(&self, partition: u32, file: u32, requests: &[(DiskRef, PartSet)]) -> Vec<Result<Payload>> {
        let path = self.layout.file_path(partition, file);
        let mut reader = match BlockReader::open(&path) {
            Ok(reader) => reader,
            Err(e) => {
                return requests
                    .iter()
                    .map(|_| {
                        Err(Error::IoError(io::Error::new(
                            e.kind(),
                            format!("{}: {}", path.display(), e),
                        )))
                    })
                    .collect();
            }
        };

        let cipher = self.cipher.as_deref();
        let mut out: Vec<Option<Result<Payload>>> = requests.iter().map(|_| None).collect();
        let reads = requests
            .iter()
            .enumerate()
            .map(|(idx, (disk_ref, _))| ReadRequest {
                position: disk_ref.position(),
                len: disk_ref.total_size(),
                tag: idx,
            })
            .collect();
        reader.read_sorted(reads, |idx, bytes| {
            let (disk_ref, wanted) = &requests[idx];
            let decoded = bytes
                .map_err(Error::from)
                .and_then(|b| decode_record(b, disk_ref, *wanted, cipher).map_err(Error::from));
            out[idx] = Some(decoded);
        });

        out.into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::corruption("record skipped by block reader"))))
            .collect()
    }

    /// Read the requested parts of one record
    pub fn read_one(&self, disk_ref: &DiskRef, parts: PartSet) -> Result<Payload> {
        let mut reader = BlockReader::open(
            &self
                .layout
                .file_path(disk_ref.partition(), disk_ref.insert_file_id()),
        )?;
        let bytes = reader.read_at(disk_ref.position(), disk_ref.total_size())?;
        Ok(decode_record(bytes, disk_ref, parts, self.cipher.as_deref())?)
    }

    /// Release `count` records of a file, deleting it when none remain
    ///
    /// Returns true if the file was deleted.
    pub fn release(&self, partition: u32, file: u32, count: usize) -> Result<bool> {
        let emptied = {
            let mut ledger = self.ledger.lock();
            match ledger.get_mut(&(partition, file)) {
                Some(live) => {
                    *live = live.saturating_sub(count);
                    if *live == 0 {
                        ledger.remove(&(partition, file));
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if emptied {
            self.layout.remove_file(partition, file)?;
            debug!(target: "geocache::disk", partition, file, "Deleted emptied block file");
        }
        Ok(emptied)
    }

    /// Records of a file still referenced
    pub fn live_records(&self, partition: u32, file: u32) -> usize {
        self.ledger
            .lock()
            .get(&(partition, file))
            .copied()
            .unwrap_or(0)
    }

    /// Mark a partition removed and forget its files
    pub fn retire_partition(&self, partition: u32) {
        self.retired.lock().insert(partition);
        self.ledger.lock().retain(|(p, _), _| *p != partition);
        self.next_file.lock().remove(&partition);
    }

    /// Whether a partition belongs to a removed type
    pub fn is_retired(&self, partition: u32) -> bool {
        self.retired.lock().contains(&partition)
    }

    /// Delete a partition directory
    pub fn purge_partition(&self, partition: u32) -> Result<()> {
        self.layout.remove_partition(partition)?;
        Ok(())
    }

    /// Delete the whole session
    pub fn destroy(&self) -> Result<()> {
        self.ledger.lock().clear();
        self.layout.destroy()?;
        Ok(())
    }
}

impl GroupFetcher for DiskStore {
    fn fetch_group(&self, group: &[RetrieveRequest], wanted: &[PartSet]) -> Vec<Result<Payload>> {
        // Every request of a group points into the same file
        let mut by_file: FxHashMap<(u32, u32), Vec<usize>> = FxHashMap::default();
        let mut out: Vec<Option<Result<Payload>>> = group.iter().map(|_| None).collect();
        for (idx, request) in group.iter().enumerate() {
            match request.store_ref.as_disk() {
                Some(r) => by_file
                    .entry((r.partition(), r.insert_file_id()))
                    .or_default()
                    .push(idx),
                None => {
                    out[idx] = Some(Err(Error::invalid_argument("registry reference in disk store")));
                }
            }
        }

        for ((partition, file), indexes) in by_file {
            let requests: Vec<(DiskRef, PartSet)> = indexes
                .iter()
                .filter_map(|&i| group[i].store_ref.as_disk().map(|r| (r.clone(), wanted[i])))
                .collect();
            for (i, result) in indexes.into_iter().zip(self.read_records(partition, file, &requests)) {
                out[i] = Some(result);
            }
        }

        out.into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::corruption("record not read"))))
            .collect()
    }
}

/// Spill one batch and attach the references it produced
///
/// Runs on the spill pool. Entries removed between write and attach are
/// released right away; a write into a removed type's partition is purged.
pub(crate) fn spill_batch(
    store: &DiskStore,
    partition: u32,
    file: u32,
    batch: Vec<(RecordId, Arc<CacheEntry>)>,
) {
    if store.is_retired(partition) {
        return;
    }
    let written = match store.write_batch(partition, file, &batch) {
        Ok(written) => written,
        Err(e) => {
            warn!(
                target: "geocache::disk",
                partition,
                file,
                records = batch.len(),
                error = %e,
                "Spill batch failed, records stay resident"
            );
            return;
        }
    };

    let mut orphans = 0;
    for (idx, disk_ref) in written {
        if !batch[idx].1.attach_store_ref(StoreRef::Disk(disk_ref)) {
            orphans += 1;
        }
    }
    if orphans > 0 {
        debug!(target: "geocache::disk", partition, file, orphans, "Releasing records removed during spill");
        if let Err(e) = store.release(partition, file, orphans) {
            warn!(target: "geocache::disk", partition, file, error = %e, "Failed to release orphaned records");
        }
    }

    if store.is_retired(partition) {
        if let Err(e) = store.purge_partition(partition) {
            warn!(target: "geocache::disk", partition, error = %e, "Failed to purge late spill");
        }
    }
}

/// Backend assistant over [`DiskStore`]
pub struct DiskAssistant {
    store: Arc<DiskStore>,
    ctx: BackendContext,
    block_size: usize,
}

impl DiskAssistant {
    /// Open the disk store under `root`
    pub fn open(
        ctx: BackendContext,
        root: &Path,
        cipher: Option<SharedCipher>,
        block_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            store: Arc::new(DiskStore::open(root, cipher)?),
            ctx,
            block_size: block_size.max(1),
        })
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<DiskStore> {
        &self.store
    }
}

impl BackendAssistant for DiskAssistant {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn cache_elements(&self, type_key: &TypeKey, entries: Vec<(RecordId, Arc<CacheEntry>)>) {
        if entries.is_empty() {
            return;
        }
        let partition = self.ctx.registry.partition_of(type_key);
        let mut entries = entries.into_iter().peekable();
        while entries.peek().is_some() {
            let batch: Vec<_> = entries.by_ref().take(self.block_size).collect();
            let file = self.store.next_file_id(partition);
            let store = Arc::clone(&self.store);
            submit_or_run(&self.ctx.pools.spill, TaskPriority::BulkInsert, move || {
                spill_batch(&store, partition, file, batch)
            });
        }
    }

    fn retrieve_and_update(
        &self,
        parts: PartSet,
        batch: Vec<RetrieveRequest>,
        update: RetrieveUpdate,
    ) -> Vec<Retrieved> {
        fan_out_retrieve(&self.store, &self.ctx, |r| self.group_key(r), parts, batch, update)
    }

    fn remove_elements(&self, refs: Vec<StoreRef>) {
        let mut per_file: FxHashMap<(u32, u32), usize> = FxHashMap::default();
        for r in refs.iter().filter_map(StoreRef::as_disk) {
            *per_file
                .entry((r.partition(), r.insert_file_id()))
                .or_default() += 1;
        }
        if per_file.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        submit_or_run(&self.ctx.pools.spill, TaskPriority::Removal, move || {
            for ((partition, file), count) in per_file {
                if let Err(e) = store.release(partition, file, count) {
                    warn!(target: "geocache::disk", partition, file, error = %e, "Failed to release block records");
                }
            }
        });
    }

    fn data_type_removed(&self, type_key: &TypeKey) {
        let Some(partition) = self.ctx.registry.existing_partition(type_key) else {
            return;
        };
        self.store.retire_partition(partition);
        let store = Arc::clone(&self.store);
        let type_name = type_key.clone();
        submit_or_run(&self.ctx.pools.spill, TaskPriority::Maintenance, move || {
            match store.purge_partition(partition) {
                Ok(()) => info!(target: "geocache::disk", type_key = %type_name, partition, "Deleted partition of removed type"),
                Err(e) => warn!(target: "geocache::disk", type_key = %type_name, partition, error = %e, "Failed to delete partition"),
            }
        });
    }

    fn direct_access_retriever(&self, type_key: &TypeKey) -> Arc<dyn DirectAccessRetriever> {
        Arc::new(DiskRetriever {
            store: Arc::clone(&self.store),
            partition: self.ctx.registry.existing_partition(type_key),
        })
    }

    fn preferred_insert_block_size(&self) -> usize {
        self.block_size
    }

    fn group_key(&self, store_ref: &StoreRef) -> u64 {
        match store_ref {
            StoreRef::Disk(r) => ((r.partition() as u64) << 32) | r.insert_file_id() as u64,
            StoreRef::Registry(r) => r.external_id(),
        }
    }

    fn shutdown(&self) {
        match self.store.destroy() {
            Ok(()) => info!(target: "geocache::disk", "Disk store removed"),
            Err(e) => warn!(target: "geocache::disk", error = %e, "Failed to remove disk store"),
        }
    }
}

struct DiskRetriever {
    store: Arc<DiskStore>,
    partition: Option<u32>,
}

impl DirectAccessRetriever for DiskRetriever {
    fn retrieve(&self, store_ref: &StoreRef, parts: PartSet) -> Result<Payload> {
        let disk_ref = store_ref
            .as_disk()
            .ok_or_else(|| Error::invalid_argument("not a disk reference"))?;
        if self.partition != Some(disk_ref.partition()) {
            return Err(Error::invalid_argument(format!(
                "reference points into partition {}, not this type's",
                disk_ref.partition()
            )));
        }
        let readable = parts.intersection(disk_ref.presence().parts());
        if readable.is_empty() {
            return Ok(Payload::empty());
        }
        self.store.read_one(disk_ref, readable)
    }
}
