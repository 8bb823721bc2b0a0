//! Disk storage backend
//!
//! Directory layout:
//! - `<id>.vseg`: one segment per file, header + payload (see [`crate::format`])
//! - `<id>.tmp`: segment being written, renamed into place when complete
//! - `access.vidx`: recency index written by `flush`

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use crate::error::{Error, Result};
use crate::eviction::{EvictionPolicy, LruPolicy};
use crate::format::{
    encode_index, encode_segment_header, parse_index, parse_segment_header, SegmentHeader,
    MAX_HEADER_LEN,
};
use crate::key::CacheKey;
use crate::ledger::{CacheEntry, Ledger};

const SEGMENT_EXT: &str = "vseg";
const TEMP_EXT: &str = "tmp";
const INDEX_FILE: &str = "access.vidx";

/// Handle to a segment file, named by its id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentFile {
    id: u64,
}

struct DiskState {
    ledger: Ledger<SegmentFile>,
    next_id: u64,
    closed: bool,
}

/// Segments persisted as individual files under a directory
pub struct DiskStore {
    dir: PathBuf,
    state: Mutex<DiskState>,
}

impl DiskStore {
    /// Open or create a store at `path` bounded to `capacity` bytes
    ///
    /// Existing segments are recovered; corrupt or half-written files are
    /// deleted. If the recovered data exceeds `capacity`, the least recently
    /// used segments are evicted right away.
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        Self::open_with_policy(path, capacity, Arc::new(LruPolicy))
    }

    /// Open with a custom eviction policy
    pub fn open_with_policy<P: AsRef<Path>>(
        path: P,
        capacity: u64,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = DiskStore {
            dir,
            state: Mutex::new(DiskState {
                ledger: Ledger::new(capacity, policy),
                next_id: 0,
                closed: false,
            }),
        };
        store.recover()?;
        Ok(store)
    }

    /// Directory holding the segment files
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write the recency index and refuse further operations
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.write_index(&state)?;
        state.closed = true;
        Ok(())
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.{}", id, SEGMENT_EXT))
    }

    fn temp_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.{}", id, TEMP_EXT))
    }

    fn recover(&self) -> Result<()> {
        let mut found: HashMap<CacheKey, (u64, SegmentHeader)> = HashMap::new();
        let mut max_id = None;

        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());

            if ext == Some(TEMP_EXT) {
                debug!(path = %path.display(), "removing partial segment");
                remove_file(&path);
                continue;
            }
            if ext != Some(SEGMENT_EXT) {
                continue;
            }

            let id = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            {
                Some(id) => id,
                None => continue,
            };
            max_id = max_id.max(Some(id));

            let header = match read_header(&path) {
                Ok(header) => header,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable segment");
                    remove_file(&path);
                    continue;
                }
            };

            // A crash between writing a replacement and deleting the old file
            // leaves two segments for one key; keep the newer one.
            match found.get(&header.key) {
                Some((_, other)) if other.stamp >= header.stamp => remove_file(&path),
                Some((other_id, _)) => {
                    remove_file(&self.segment_path(*other_id));
                    found.insert(header.key.clone(), (id, header));
                }
                None => {
                    found.insert(header.key.clone(), (id, header));
                }
            }
        }

        let stamps = self.read_index();

        let mut recovered: Vec<(u64, SegmentHeader)> = found.into_values().collect();
        for (id, header) in recovered.iter_mut() {
            if let Some(stamp) = stamps.get(id) {
                header.stamp = *stamp;
            }
        }
        recovered.sort_by_key(|(_, header)| header.stamp);

        let mut state = self.state.lock();
        for (id, header) in recovered {
            state
                .ledger
                .insert_stamped(header.key, SegmentFile { id }, header.payload_len, header.stamp);
        }
        state.next_id = max_id.map_or(0, |id| id + 1);

        if state.ledger.size() > state.ledger.capacity() {
            let evicted = state.ledger.make_room(0)?;
            debug!(count = evicted.len(), "evicted recovered segments over capacity");
            self.discard(evicted);
        }

        debug!(
            dir = %self.dir.display(),
            segments = state.ledger.len(),
            bytes = state.ledger.size(),
            "disk store opened"
        );
        Ok(())
    }

    fn read_index(&self) -> HashMap<u64, u64> {
        let path = self.dir.join(INDEX_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable recency index");
                return HashMap::new();
            }
        };

        match parse_index(&data) {
            Ok(stamps) => stamps.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "ignoring corrupt recency index");
                HashMap::new()
            }
        }
    }

    fn write_index(&self, state: &DiskState) -> Result<()> {
        let stamps: Vec<(u64, u64)> = state
            .ledger
            .iter()
            .map(|(_, entry)| (entry.payload().id, entry.last_access()))
            .collect();

        let tmp = self.dir.join(format!("{}.{}", INDEX_FILE, TEMP_EXT));
        let mut file = File::create(&tmp)?;
        file.write_all(&encode_index(&stamps))?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }

    fn write_segment(&self, id: u64, header: &[u8], data: &[u8]) -> Result<()> {
        let tmp = self.temp_path(id);
        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(header)?;
            file.write_all(data)?;
            file.sync_data()?;
            fs::rename(&tmp, self.segment_path(id))
        })();

        if result.is_err() {
            remove_file(&tmp);
        }
        result.map_err(Error::from)
    }

    fn read_segment(&self, id: u64, key: &CacheKey) -> Result<Bytes> {
        let data = Bytes::from(fs::read(self.segment_path(id))?);
        let (header, header_len) = parse_segment_header(&data)?;

        if header.key != *key {
            return Err(Error::Parse(format!(
                "Segment {:016x} holds {}, expected {}",
                id, header.key, key
            )));
        }
        if (data.len() - header_len) as u64 != header.payload_len {
            return Err(Error::Parse(format!(
                "Segment {:016x} payload is {} bytes, header says {}",
                id,
                data.len() - header_len,
                header.payload_len
            )));
        }

        Ok(data.slice(header_len..))
    }

    fn discard(&self, entries: Vec<(CacheKey, CacheEntry<SegmentFile>)>) -> Vec<CacheKey> {
        entries
            .into_iter()
            .map(|(key, entry)| {
                remove_file(&self.segment_path(entry.into_payload().id));
                key
            })
            .collect()
    }
}

fn read_header(path: &Path) -> Result<SegmentHeader> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut prefix = Vec::with_capacity(MAX_HEADER_LEN);
    file.take(MAX_HEADER_LEN as u64).read_to_end(&mut prefix)?;
    let (header, header_len) = parse_segment_header(&prefix)?;

    let expected = (header_len as u64)
        .checked_add(header.payload_len)
        .ok_or_else(|| {
            Error::Parse(format!("Segment payload length {} overflows", header.payload_len))
        })?;
    if file_len != expected {
        return Err(Error::Parse(format!(
            "Truncated segment: {} bytes on disk, expected {}",
            file_len, expected
        )));
    }
    Ok(header)
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove segment file");
        }
    }
}

impl StorageBackend for DiskStore {
    fn put(&self, key: CacheKey, data: Bytes) -> Result<Vec<CacheKey>> {
        let size = data.len() as u64;
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        state.ledger.check_fits(size)?;

        let stamp = state.ledger.next_tick();
        let header = encode_segment_header(&key, stamp, size)?;

        if let Some(old) = state.ledger.remove(&key) {
            remove_file(&self.segment_path(old.into_payload().id));
        }
        let evicted = state.ledger.make_room(size)?;
        let evicted = self.discard(evicted);

        let id = state.next_id;
        state.next_id += 1;
        self.write_segment(id, &header, &data)?;
        state
            .ledger
            .insert_stamped(key, SegmentFile { id }, size, stamp);

        Ok(evicted)
    }

    fn get(&self, key: &CacheKey) -> Result<Bytes> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let id = match state.ledger.touch(key) {
            Some(entry) => entry.payload().id,
            None => return Err(Error::Miss),
        };

        match self.read_segment(id, key) {
            Ok(data) => Ok(data),
            Err(e) => {
                warn!(%key, error = %e, "segment unreadable, serving as miss");
                state.ledger.mark_invalid(key);
                Err(Error::Miss)
            }
        }
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        match state.ledger.remove(key) {
            Some(entry) => {
                remove_file(&self.segment_path(entry.into_payload().id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_resource(&self, resource: &str) -> Result<Vec<CacheKey>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let removed = state.ledger.remove_resource(resource);
        Ok(self.discard(removed))
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().ledger.contains(key)
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.state.lock().ledger.keys()
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let removed = state.ledger.drain();
        self.discard(removed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        self.write_index(&state)
    }

    fn current_size(&self) -> u64 {
        self.state.lock().ledger.size()
    }

    fn capacity(&self) -> u64 {
        self.state.lock().ledger.capacity()
    }

    fn len(&self) -> usize {
        self.state.lock().ledger.len()
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ByteRange;
    use tempfile::TempDir;

    fn key(name: &str, start: u64, end: u64) -> CacheKey {
        CacheKey::new(name, ByteRange::new(start, end).unwrap())
    }

    fn bytes(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    fn segment_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|e| e.to_str())
                    == Some(SEGMENT_EXT)
            })
            .count()
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();

        store.put(key("v1", 0, 5), Bytes::from_static(b"hello")).unwrap();

        assert_eq!(store.get(&key("v1", 0, 5)).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.current_size(), 5);
        assert!(matches!(store.get(&key("v1", 5, 10)), Err(Error::Miss)));
    }

    #[test]
    fn test_capacity_scenario() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), 100).unwrap();

        store.put(key("A", 0, 60), bytes(60, b'a')).unwrap();
        let evicted = store.put(key("B", 0, 60), bytes(60, b'b')).unwrap();

        assert_eq!(evicted, vec![key("A", 0, 60)]);
        assert!(store.contains(&key("B", 0, 60)));
        assert_eq!(store.current_size(), 60);
        assert_eq!(segment_files(dir.path()), 1);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskStore::open(dir.path(), 1024).unwrap();
            store.put(key("v1", 0, 3), Bytes::from_static(b"one")).unwrap();
            store.put(key("v1", 3, 6), Bytes::from_static(b"two")).unwrap();
            store.close().unwrap();
        }

        {
            let store = DiskStore::open(dir.path(), 1024).unwrap();
            assert_eq!(store.len(), 2);
            assert_eq!(store.current_size(), 6);
            assert_eq!(store.get(&key("v1", 0, 3)).unwrap(), Bytes::from_static(b"one"));
            assert_eq!(store.get(&key("v1", 3, 6)).unwrap(), Bytes::from_static(b"two"));
        }
    }

    #[test]
    fn test_recency_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskStore::open(dir.path(), 100).unwrap();
            store.put(key("A", 0, 40), bytes(40, 1)).unwrap();
            store.put(key("B", 0, 40), bytes(40, 2)).unwrap();
            store.get(&key("A", 0, 40)).unwrap();
            store.close().unwrap();
        }

        let store = DiskStore::open(dir.path(), 100).unwrap();
        store.put(key("C", 0, 40), bytes(40, 3)).unwrap();

        assert!(store.contains(&key("A", 0, 40)));
        assert!(!store.contains(&key("B", 0, 40)));
    }

    #[test]
    fn test_reopen_with_smaller_capacity() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskStore::open(dir.path(), 1000).unwrap();
            for i in 0..5u64 {
                store.put(key("v", i * 100, (i + 1) * 100), bytes(100, i as u8)).unwrap();
            }
        }

        let store = DiskStore::open(dir.path(), 250).unwrap();
        assert!(store.current_size() <= 250);
        assert_eq!(store.len(), 2);
        assert!(store.contains(&key("v", 400, 500)));
        assert_eq!(segment_files(dir.path()), 2);
    }

    #[test]
    fn test_recovery_discards_corrupt_files() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskStore::open(dir.path(), 1024).unwrap();
            store.put(key("good", 0, 4), Bytes::from_static(b"good")).unwrap();
        }

        fs::write(dir.path().join("00000000000000ff.vseg"), b"garbage").unwrap();
        fs::write(dir.path().join("0000000000000100.tmp"), b"partial").unwrap();

        let store = DiskStore::open(dir.path(), 1024).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!dir.path().join("00000000000000ff.vseg").exists());
        assert!(!dir.path().join("0000000000000100.tmp").exists());

        // New ids must not collide with anything seen on disk.
        store.put(key("next", 0, 1), Bytes::from_static(b"n")).unwrap();
        assert!(dir.path().join("0000000000000100.vseg").exists());
    }

    #[test]
    fn test_recovery_discards_impossible_payload_length() {
        let dir = TempDir::new().unwrap();
        let header = encode_segment_header(&key("v1", 0, 4), 1, u64::MAX).unwrap();
        let path = dir.path().join("0000000000000001.vseg");
        fs::write(&path, header).unwrap();

        let store = DiskStore::open(dir.path(), 1024).unwrap();
        assert_eq!(store.len(), 0);
        assert_eq!(store.current_size(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_unreadable_segment_becomes_miss() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();
        store.put(key("v1", 0, 4), Bytes::from_static(b"data")).unwrap();

        fs::remove_file(dir.path().join("0000000000000000.vseg")).unwrap();

        assert!(matches!(store.get(&key("v1", 0, 4)), Err(Error::Miss)));
        assert!(!store.contains(&key("v1", 0, 4)));

        // The invalid entry is reclaimed first when space is needed.
        store.put(key("v2", 0, 1021), bytes(1021, 1)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size(), 1021);
    }

    #[test]
    fn test_replace_removes_old_file() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();

        store.put(key("v1", 0, 4), Bytes::from_static(b"old!")).unwrap();
        store.put(key("v1", 0, 4), Bytes::from_static(b"new!")).unwrap();

        assert_eq!(segment_files(dir.path()), 1);
        assert_eq!(store.get(&key("v1", 0, 4)).unwrap(), Bytes::from_static(b"new!"));
    }

    #[test]
    fn test_remove_resource_deletes_files() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();

        store.put(key("v1", 0, 2), bytes(2, 1)).unwrap();
        store.put(key("v1", 2, 4), bytes(2, 1)).unwrap();
        store.put(key("v2", 0, 2), bytes(2, 1)).unwrap();

        let removed = store.remove_resource("v1").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(segment_files(dir.path()), 1);
    }

    #[test]
    fn test_operations_after_close() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();

        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(
            store.put(key("v1", 0, 1), Bytes::from_static(b"x")),
            Err(Error::Closed)
        ));
        assert!(matches!(store.get(&key("v1", 0, 1)), Err(Error::Closed)));
    }
}
