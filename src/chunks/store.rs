use std::cmp::min;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use md5;
use rand::{self, Rng};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use ::inode::InodeInfo;
use ::meta::{MetaClient, MetaError};
use super::cipher::ChunkCipher;

/// Soft TTL for read cache entries.
const READ_CACHE_TTL: Duration = Duration::from_secs(30);
/// Opportunistic flushing starts once this many chunks are buffered.
const MAX_WRITE_BUFFER_SIZE: usize = 5;
/// Download attempts per chunk before giving up.
const DOWNLOAD_TRIES: u32 = 5;
/// Pause between upload retries.
const RETRY_PAUSE: Duration = Duration::from_secs(3);

/// Names one ciphertext blob in the whole system: (inode, chunk index).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChunkKey {
    pub inode: u64,
    pub index: u32
}

struct CacheEntry {
    data: Vec<u8>,
    last_update: Instant
}

impl CacheEntry {
    fn new(data: Vec<u8>) -> Self {
        CacheEntry { data: data, last_update: Instant::now() }
    }
}

/// Maps guarded by the global cache lock.
///
/// A key lives in at most one of `write_buffer` and `read_cache`. The write
/// buffer entry is authoritative for reads until the chunk is committed, at
/// which point it moves to the read cache in one critical section.
struct CacheState {
    write_buffer: HashMap<ChunkKey, CacheEntry>,
    read_cache: HashMap<ChunkKey, CacheEntry>,
    size_override: HashMap<u64, u64>,
    inode_locks: HashMap<u64, Arc<Mutex<()>>>
}

quick_error!{
    #[derive(Debug)]
    pub enum ChunkError {
        Download(inode: u64, index: u32) {
            description("Chunk download failed")
            display("Failed to download chunk {}.{}", inode, index)
        }
        SizeUpdate(err: MetaError) {
            cause(err)
            description("Failed to update file size")
            display("Failed to update file size on metaserver: {}", err)
        }
    }
}

/// The chunk I/O engine: read cache, write buffer, per-inode locking and the
/// upload/finalize protocol against metaserver and chunk servers.
pub struct ChunkStore {
    meta: Arc<MetaClient>,
    cipher: ChunkCipher,
    location: String,
    state: Mutex<CacheState>,
    shutdown: AtomicBool
}

impl ChunkStore {
    pub fn new(meta: Arc<MetaClient>, cipher: ChunkCipher, location: &str) -> Self {
        ChunkStore {
            meta: meta,
            cipher: cipher,
            location: location.to_string(),
            state: Mutex::new(CacheState {
                write_buffer: HashMap::new(),
                read_cache: HashMap::new(),
                size_override: HashMap::new(),
                inode_locks: HashMap::new()
            }),
            shutdown: AtomicBool::new(false)
        }
    }

    /// Signals flush retry loops and the cleaner to wind down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The lock serializing reads, write staging and flushing for one inode.
    pub fn inode_lock(&self, inode: u64) -> Arc<Mutex<()>> {
        let mut state = self.state.lock().unwrap();
        state.inode_locks.entry(inode).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Reported logical size: a pending override wins over the metaserver
    /// record.
    pub fn reported_size(&self, info: &InodeInfo) -> u64 {
        let state = self.state.lock().unwrap();
        state.size_override.get(&info.inode()).cloned().unwrap_or_else(|| info.size())
    }

    /// Records truncation to zero before any upload happened (open with
    /// O_TRUNC).
    pub fn truncate(&self, inode: u64) {
        self.state.lock().unwrap().size_override.insert(inode, 0);
    }

    /// Forgets a pending size override after a shrink was persisted.
    pub fn clear_override(&self, inode: u64) {
        self.state.lock().unwrap().size_override.remove(&inode);
    }

    pub fn cache_stats(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.write_buffer.len(), state.read_cache.len())
    }

    /// Reads `length` bytes at `offset`, assembling plaintext from the write
    /// buffer, the read cache or the chunk servers.
    pub fn read(&self, info: &InodeInfo, offset: u64, length: u32) -> Result<Vec<u8>, ChunkError> {
        let chunk_size = info.chunk_size();
        let inode = info.inode();
        let length = length as u64;
        let start_chunk = offset / chunk_size;
        let end_chunk = (offset + length) / chunk_size;
        debug!("read inode {}, offset {}, len {}, chunks {}-{}, path {}",
               inode, offset, length, start_chunk, end_chunk, info.path());

        let lock = self.inode_lock(inode);
        let _guard = lock.lock().unwrap();

        let mut chunks_data = Vec::new();
        for index in start_chunk..end_chunk + 1 {
            let chunk = self.get_chunk_data(inode, index as u32, DOWNLOAD_TRIES)?;
            chunks_data.extend_from_slice(&chunk);
        }

        let data_offset = (offset % chunk_size) as usize;
        let start = min(data_offset, chunks_data.len());
        let end = min(data_offset + length as usize, chunks_data.len());
        Ok(chunks_data[start..end].to_vec())
    }

    /// Stages a write in the write buffer. The caller triggers an
    /// opportunistic flush afterwards.
    pub fn write(&self, info: &InodeInfo, offset: u64, buf: &[u8]) -> Result<(), ChunkError> {
        let chunk_size = info.chunk_size();
        let inode = info.inode();
        let start_chunk = offset / chunk_size;
        let end_chunk = (offset + buf.len() as u64) / chunk_size;
        debug!("write inode {}, offset {}, len {}, chunks {}-{}",
               inode, offset, buf.len(), start_chunk, end_chunk);

        let lock = self.inode_lock(inode);
        let _guard = lock.lock().unwrap();

        let mut chunks_data = Vec::new();
        for index in start_chunk..end_chunk + 1 {
            let mut chunk = self.get_chunk_data(inode, index as u32, DOWNLOAD_TRIES)?;
            // pad with zero bytes unless it is the final chunk, so chunks
            // align in the concatenation
            if index != end_chunk {
                chunk.resize(chunk_size as usize, 0);
            }
            chunks_data.extend_from_slice(&chunk);
        }

        let data_offset = (offset % chunk_size) as usize;
        splice(&mut chunks_data, data_offset, buf);

        let mut state = self.state.lock().unwrap();
        for index in start_chunk..end_chunk + 1 {
            let slice_start = min(((index - start_chunk) * chunk_size) as usize, chunks_data.len());
            let slice_end = min(slice_start + chunk_size as usize, chunks_data.len());
            let key = ChunkKey { inode: inode, index: index as u32 };
            state.write_buffer.insert(key, CacheEntry::new(chunks_data[slice_start..slice_end].to_vec()));
            state.read_cache.remove(&key);
        }

        let old_size = state.size_override.get(&inode).cloned().unwrap_or_else(|| info.size());
        let new_size = offset + buf.len() as u64;
        if new_size > old_size {
            debug!("With this write, inode {} grew from {} to {} bytes", inode, old_size, new_size);
            state.size_override.insert(inode, new_size);
        }
        Ok(())
    }

    /// Current plaintext of a chunk. The caller must hold the inode lock.
    ///
    /// A chunk the metaserver does not know yet is a hole and reads as empty,
    /// without retries and without populating the read cache.
    fn get_chunk_data(&self, inode: u64, index: u32, tries: u32) -> Result<Vec<u8>, ChunkError> {
        let key = ChunkKey { inode: inode, index: index };
        {
            let state = self.state.lock().unwrap();
            if let Some(entry) = state.write_buffer.get(&key) {
                return Ok(entry.data.clone())
            }
            if let Some(entry) = state.read_cache.get(&key) {
                return Ok(entry.data.clone())
            }
        }
        for attempt in 0..tries {
            if attempt > 0 {
                warn!("Error while downloading chunk {}.{}, retrying ({} tries left)",
                      inode, index, tries - attempt);
            }
            let mut request = json!({"file": inode, "chunk": index});
            if !self.location.is_empty() {
                request["location"] = json!(self.location);
            }
            let response = match self.meta.post("chunkDownload", &request) {
                Ok(response) => response,
                Err(err) => {
                    if err.code() == Some(15) { // chunk not exists
                        debug!("chunk {}.{} does not exist, returning empty data", inode, index);
                        return Ok(Vec::new())
                    }
                    error!("API error while downloading chunk {}.{}: {}", inode, index, err);
                    continue
                }
            };
            let url = match response.get("url").and_then(Value::as_str) {
                Some(url) => url.to_string(),
                None => {
                    error!("chunkDownload response carries no url");
                    continue
                }
            };
            let checksum = response.get("checksum").and_then(Value::as_str).unwrap_or("").to_string();
            let node_response = match self.meta.http().get(url.as_str()).send() {
                Ok(response) => response,
                Err(err) => {
                    error!("Failed to connect to chunk server: {}", err);
                    continue
                }
            };
            if !node_response.status().is_success() {
                error!("Chunk server returned status {} while downloading chunk {}.{}",
                       node_response.status(), inode, index);
                continue
            }
            let ciphertext = match node_response.bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!("Failed to read chunk server response: {}", err);
                    continue
                }
            };
            if format!("{:x}", md5::compute(&ciphertext)) != checksum {
                error!("Checksum error while downloading chunk {}.{}, size of downloaded data was {}",
                       inode, index, ciphertext.len());
                continue
            }
            info!("Downloaded chunk {} for inode {}", index, inode);
            let plaintext = self.cipher.decrypt(inode, index, &ciphertext);
            let mut state = self.state.lock().unwrap();
            state.read_cache.insert(key, CacheEntry::new(plaintext.clone()));
            return Ok(plaintext)
        }
        error!("Giving up on chunk {}.{} after {} tries", inode, index, tries);
        Err(ChunkError::Download(inode, index))
    }

    /// Uploads buffered chunks.
    ///
    /// With `force_inode` every buffered chunk of that inode is committed (or
    /// dropped because the file is gone) before returning; otherwise entries
    /// are only drained once the buffer has reached its threshold.
    pub fn flush(&self, force_inode: Option<u64>) -> Result<(), ChunkError> {
        debug!("Processing write buffer (force_inode={:?})", force_inode);
        while let Some((key, lock)) = self.next_entry(force_inode) {
            let guard = lock.lock().unwrap();
            let proceed = self.flush_entry(key)?;
            drop(guard);
            if !proceed {
                break
            }
        }
        Ok(())
    }

    /// Selects a buffered chunk to upload and hands out its inode lock.
    ///
    /// A forced selection only ever yields chunks of that inode; once none
    /// are left the flush is over, no matter how full the buffer is.
    fn next_entry(&self, force_inode: Option<u64>) -> Option<(ChunkKey, Arc<Mutex<()>>)> {
        let mut state = self.state.lock().unwrap();
        let key = match force_inode {
            Some(inode) => {
                let key = state.write_buffer.keys().find(|key| key.inode == inode).cloned();
                if key.is_none() {
                    debug!("No buffered chunks for inode {}", inode);
                }
                key?
            }
            None => {
                debug!("Write buffer entries: {} / {}", state.write_buffer.len(), MAX_WRITE_BUFFER_SIZE);
                if state.write_buffer.len() < MAX_WRITE_BUFFER_SIZE {
                    return None
                }
                state.write_buffer.keys().next().cloned()?
            }
        };
        let lock = state.inode_locks.entry(key.inode).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        Some((key, lock))
    }

    /// Runs the upload protocol for one chunk until it is committed or
    /// dropped. The caller holds the inode lock.
    ///
    /// Returns false when the flush pass should stop: the file was deleted
    /// remotely, or a shutdown was requested.
    fn flush_entry(&self, key: ChunkKey) -> Result<bool, ChunkError> {
        loop {
            if self.is_shutdown() {
                error!("Shutting down with unflushed data, chunk {}.{} is lost", key.inode, key.index);
                return Ok(false)
            }
            let plaintext = {
                let state = self.state.lock().unwrap();
                match state.write_buffer.get(&key) {
                    Some(entry) => entry.data.clone(),
                    None => return Ok(true)
                }
            };
            let ciphertext = self.cipher.encrypt(key.inode, key.index, &plaintext);
            debug_assert_eq!(ciphertext.len(), plaintext.len());
            let checksum = format!("{:x}", md5::compute(&ciphertext));

            debug!("chunkUploadInit for inode {} chunk {} with size {}",
                   key.inode, key.index, ciphertext.len());
            let mut request = json!({
                "file": key.inode,
                "chunk": key.index,
                "checksum": checksum,
                "size": ciphertext.len()
            });
            if !self.location.is_empty() {
                request["location"] = json!(self.location);
            }
            let response = match self.meta.post("chunkUploadInit", &request) {
                Ok(response) => response,
                Err(err) => {
                    if err.code() == Some(2) { // file not exists
                        warn!("File deleted while chunk {}.{} was still buffered, dropping it",
                              key.inode, key.index);
                        self.state.lock().unwrap().write_buffer.remove(&key);
                        return Ok(false)
                    }
                    warn!("Unexpected chunkUploadInit failure ({}), trying again in 3 seconds", err);
                    thread::sleep(RETRY_PAUSE);
                    continue
                }
            };

            let temp_id = response.get("id").cloned().unwrap_or(Value::Null);
            let nodes = response.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();
            if nodes.is_empty() {
                warn!("Can't upload chunk, didn't receive any nodes from metaserver. \
                       Trying again in 3 seconds");
                thread::sleep(RETRY_PAUSE);
                continue
            }

            debug!("Uploading chunk {} for inode {} to {} nodes", key.index, key.inode, nodes.len());
            let mut success_node_ids = Vec::new();
            for node in &nodes {
                let node_id = node.get("id").cloned().unwrap_or(Value::Null);
                let address = match node.get("address").and_then(Value::as_str) {
                    Some(address) => address,
                    None => continue
                };
                match self.meta.http().post(address)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(ciphertext.clone())
                    .send() {
                    Ok(response) => {
                        if response.status().is_success() {
                            info!("Uploaded chunk {} for inode {} to node {}",
                                  key.index, key.inode, node_id);
                            success_node_ids.push(node_id);
                        } else {
                            warn!("Error during upload to node {}, http status code {}",
                                  node_id, response.status());
                        }
                    }
                    Err(err) => warn!("Failed to connect to node {}: {}", node_id, err)
                }
            }
            if success_node_ids.is_empty() {
                warn!("Chunk upload failed on all nodes. Trying again in 3 seconds");
                thread::sleep(RETRY_PAUSE);
                continue
            }

            match self.meta.post("chunkUploadFinalize", &json!({"id": temp_id, "nodes": success_node_ids})) {
                Ok(_) => debug!("Finalized upload for chunk {} inode {}", key.index, key.inode),
                Err(err) => {
                    if err.code() == Some(2) { // deleted between upload and finalize
                        warn!("File no longer exists, dropping chunk {}.{} from write buffer",
                              key.inode, key.index);
                        self.state.lock().unwrap().write_buffer.remove(&key);
                        return Ok(false)
                    }
                    warn!("Failure during chunkUploadFinalize ({}), trying again in 3 seconds", err);
                    thread::sleep(RETRY_PAUSE);
                    continue
                }
            }

            // The committed chunk moves from write buffer to read cache in
            // one critical section.
            let pending_size = {
                let mut state = self.state.lock().unwrap();
                state.write_buffer.remove(&key);
                state.read_cache.insert(key, CacheEntry::new(plaintext));
                state.size_override.get(&key.inode).cloned()
            };
            if let Some(new_size) = pending_size {
                debug!("Size was overridden, updating on metaserver");
                self.meta.post("inodeUpdate", &json!({"inode": key.inode, "size": new_size}))
                    .map_err(ChunkError::SizeUpdate)?;
                // a concurrent write may have grown the override meanwhile,
                // only drop it if it still matches what was sent
                let mut state = self.state.lock().unwrap();
                if state.size_override.get(&key.inode) == Some(&new_size) {
                    state.size_override.remove(&key.inode);
                }
                info!("Sent size {} for inode {} to metaserver", new_size, key.inode);
            }
            return Ok(true)
        }
    }

    /// Drops read cache entries past their TTL.
    pub fn clean_read_cache(&self) {
        let mut state = self.state.lock().unwrap();
        if state.read_cache.is_empty() {
            return
        }
        let before = state.read_cache.len();
        state.read_cache.retain(|_, entry| entry.last_update.elapsed() < READ_CACHE_TTL);
        info!("Read cache contains {} entries, removing {}", before, before - state.read_cache.len());
    }

    /// Drops per-inode locks nobody holds or is about to take.
    pub fn clean_inode_locks(&self) {
        let mut state = self.state.lock().unwrap();
        state.inode_locks.retain(|inode, lock| {
            if Arc::strong_count(lock) == 1 && lock.try_lock().is_ok() {
                debug!("Removing lock {}", inode);
                false
            } else {
                debug!("Not removing lock {}", inode);
                true
            }
        });
    }
}

/// Overwrites `block[offset..offset+data.len()]` with `data`, growing the
/// block and zero-filling any gap before `offset`.
fn splice(block: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if block.len() < end {
        block.resize(end, 0);
    }
    block[offset..end].copy_from_slice(data);
}

/// Periodic cache maintenance, run on its own thread until shutdown.
pub fn run_cleaner(store: &ChunkStore) {
    let mut rng = rand::thread_rng();
    while !store.is_shutdown() {
        let pause = rng.gen_range(8, 16);
        for _ in 0..pause {
            thread::sleep(Duration::from_secs(1));
            if store.is_shutdown() {
                return
            }
        }
        let (buffered, cached) = store.cache_stats();
        debug!("Cache stats: {} chunks buffered, {} cached", buffered, cached);
        store.clean_read_cache();
        store.clean_inode_locks();
    }
}


#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use md5;
    use serde_json::{self, Value};

    use ::inode::InodeInfo;
    use ::meta::MetaClient;
    use super::*;
    use super::super::cipher::ChunkCipher;

    fn store() -> ChunkStore {
        let meta = Arc::new(MetaClient::new("http://localhost:9", "user", "pass").unwrap());
        ChunkStore::new(meta, ChunkCipher::new([0u8; 32]), "testloc")
    }

    fn file_info(inode: u64, size: u64, chunk_size: u64) -> InodeInfo {
        InodeInfo::from_value(json!({
            "inode": inode,
            "name": "testfile",
            "path": "/testfile",
            "parent": 1,
            "type": "f",
            "size": size,
            "chunk_size": chunk_size,
            "mtime": 0
        })).unwrap()
    }

    fn seed_write(store: &ChunkStore, inode: u64, index: u32, data: &[u8]) {
        let key = ChunkKey { inode: inode, index: index };
        store.state.lock().unwrap().write_buffer.insert(key, CacheEntry::new(data.to_vec()));
    }

    fn seed_read(store: &ChunkStore, inode: u64, index: u32, data: &[u8]) {
        let key = ChunkKey { inode: inode, index: index };
        store.state.lock().unwrap().read_cache.insert(key, CacheEntry::new(data.to_vec()));
    }

    fn buffered(store: &ChunkStore, inode: u64, index: u32) -> Option<Vec<u8>> {
        let state = store.state.lock().unwrap();
        state.write_buffer.get(&ChunkKey { inode: inode, index: index }).map(|e| e.data.clone())
    }

    fn caches_are_disjoint(store: &ChunkStore) -> bool {
        let state = store.state.lock().unwrap();
        state.write_buffer.keys().all(|key| !state.read_cache.contains_key(key))
    }

    #[test]
    fn test_splice_interior() {
        let mut block = b"0123456789".to_vec();
        splice(&mut block, 2, b"XY");
        assert_eq!(block, b"01XY456789");
    }

    #[test]
    fn test_splice_grows_block() {
        let mut block = b"0123456789".to_vec();
        splice(&mut block, 8, b"XXXX");
        assert_eq!(block, b"01234567XXXX");
    }

    #[test]
    fn test_splice_zero_fills_gap() {
        let mut block = Vec::new();
        splice(&mut block, 4, b"AB");
        assert_eq!(block, b"\0\0\0\0AB");
    }

    #[test]
    fn test_read_prefers_write_buffer() {
        let store = store();
        seed_write(&store, 7, 0, b"hello");
        seed_read(&store, 7, 0, b"stale");
        let info = file_info(7, 5, 10);
        assert_eq!(store.read(&info, 0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_read_spans_chunks() {
        let store = store();
        seed_write(&store, 5, 0, b"0123456789");
        seed_read(&store, 5, 1, b"abcde");
        let info = file_info(5, 15, 10);
        assert_eq!(store.read(&info, 8, 4).unwrap(), b"89ab");
    }

    #[test]
    fn test_read_clamps_at_eof() {
        let store = store();
        seed_read(&store, 5, 0, b"abc");
        let info = file_info(5, 3, 10);
        assert_eq!(store.read(&info, 1, 9).unwrap(), b"bc");
        assert_eq!(store.read(&info, 8, 1).unwrap(), b"");
    }

    #[test]
    fn test_write_within_chunk() {
        let store = store();
        seed_read(&store, 7, 0, b"0123456789");
        let info = file_info(7, 10, 10);
        store.write(&info, 2, b"XY").unwrap();
        assert_eq!(buffered(&store, 7, 0).unwrap(), b"01XY456789");
        assert!(caches_are_disjoint(&store));
        assert_eq!(store.read(&info, 0, 10).unwrap(), b"01XY456789");
    }

    #[test]
    fn test_write_crossing_chunk_boundary() {
        let store = store();
        seed_write(&store, 7, 0, b"0123456789");
        seed_write(&store, 7, 1, b"abcde");
        let info = file_info(7, 15, 10);
        store.write(&info, 8, b"WXYZ").unwrap();
        assert_eq!(buffered(&store, 7, 0).unwrap(), b"01234567WX");
        assert_eq!(buffered(&store, 7, 1).unwrap(), b"YZcde");
        assert_eq!(store.read(&info, 8, 4).unwrap(), b"WXYZ");
    }

    #[test]
    fn test_write_into_hole_pads_with_zeroes() {
        let store = store();
        seed_read(&store, 7, 0, b"");
        seed_read(&store, 7, 1, b"");
        let info = file_info(7, 0, 10);
        store.write(&info, 8, b"XXXX").unwrap();
        assert_eq!(buffered(&store, 7, 0).unwrap(), b"\0\0\0\0\0\0\0\0XX");
        assert_eq!(buffered(&store, 7, 1).unwrap(), b"XX");
        assert!(caches_are_disjoint(&store));
        assert_eq!(store.reported_size(&info), 12);
        assert_eq!(store.read(&info, 8, 4).unwrap(), b"XXXX");
    }

    #[test]
    fn test_write_crossing_megabyte_boundary() {
        let store = store();
        seed_read(&store, 7, 0, b"");
        seed_read(&store, 7, 1, b"");
        let info = file_info(7, 0, 1_000_000);
        store.write(&info, 999_990, &[b'X'; 20]).unwrap();
        let chunk0 = buffered(&store, 7, 0).unwrap();
        assert_eq!(chunk0.len(), 1_000_000);
        assert!(chunk0[..999_990].iter().all(|&b| b == 0));
        assert_eq!(&chunk0[999_990..], &[b'X'; 10]);
        assert_eq!(buffered(&store, 7, 1).unwrap(), &[b'X'; 10]);
        assert_eq!(store.reported_size(&info), 1_000_010);
        assert_eq!(store.read(&info, 999_990, 20).unwrap(), &[b'X'; 20]);
    }

    #[test]
    fn test_write_read_roundtrip_before_flush() {
        let store = store();
        seed_read(&store, 3, 0, b"");
        let info = file_info(3, 0, 1_000_000);
        store.write(&info, 0, b"hello").unwrap();
        assert_eq!(store.read(&info, 0, 5).unwrap(), b"hello");
        assert_eq!(store.reported_size(&info), 5);
    }

    #[test]
    fn test_size_override_is_monotonic() {
        let store = store();
        seed_write(&store, 7, 0, b"0123456789");
        seed_write(&store, 7, 1, b"abcde");
        let info = file_info(7, 15, 10);
        store.write(&info, 14, b"ZZ").unwrap();
        assert_eq!(store.reported_size(&info), 16);
        store.write(&info, 0, b"aa").unwrap();
        assert_eq!(store.reported_size(&info), 16);
    }

    #[test]
    fn test_reported_size_without_override() {
        let store = store();
        let info = file_info(9, 4321, 1_000_000);
        assert_eq!(store.reported_size(&info), 4321);
    }

    #[test]
    fn test_truncate_overrides_size() {
        let store = store();
        let info = file_info(9, 3000, 1_000_000);
        store.truncate(9);
        assert_eq!(store.reported_size(&info), 0);
        store.clear_override(9);
        assert_eq!(store.reported_size(&info), 3000);
    }

    #[test]
    fn test_flush_is_noop_on_empty_buffer() {
        let store = store();
        store.flush(None).unwrap();
        store.flush(Some(42)).unwrap();
    }

    #[test]
    fn test_flush_below_threshold_keeps_entries() {
        let store = store();
        seed_write(&store, 7, 0, b"data");
        store.flush(None).unwrap();
        assert!(buffered(&store, 7, 0).is_some());
    }

    #[test]
    fn test_flush_force_ignores_other_inodes() {
        let store = store();
        seed_write(&store, 7, 0, b"data");
        store.flush(Some(42)).unwrap();
        assert!(buffered(&store, 7, 0).is_some());
    }

    #[test]
    fn test_flush_force_is_noop_without_matching_chunks() {
        let store = store();
        // a full buffer must not tempt a forced flush into touching
        // another inode's chunks
        for index in 0..MAX_WRITE_BUFFER_SIZE as u32 + 1 {
            seed_write(&store, 7, index, b"x");
        }
        assert!(store.next_entry(Some(42)).is_none());
        store.flush(Some(42)).unwrap();
        let state = store.state.lock().unwrap();
        assert_eq!(state.write_buffer.len(), MAX_WRITE_BUFFER_SIZE + 1);
    }

    #[test]
    fn test_next_entry_force_selects_inode() {
        let store = store();
        seed_write(&store, 1, 0, b"a");
        seed_write(&store, 2, 3, b"b");
        let (key, _lock) = store.next_entry(Some(2)).unwrap();
        assert_eq!(key, ChunkKey { inode: 2, index: 3 });
    }

    #[test]
    fn test_next_entry_waits_for_threshold() {
        let store = store();
        for index in 0..MAX_WRITE_BUFFER_SIZE as u32 - 1 {
            seed_write(&store, 1, index, b"x");
        }
        assert!(store.next_entry(None).is_none());
        seed_write(&store, 1, 99, b"x");
        assert!(store.next_entry(None).is_some());
    }

    #[test]
    fn test_clean_read_cache_drops_expired_entries() {
        let store = store();
        seed_read(&store, 1, 0, b"fresh");
        {
            let mut state = store.state.lock().unwrap();
            state.read_cache.insert(ChunkKey { inode: 1, index: 1 }, CacheEntry {
                data: b"old".to_vec(),
                last_update: Instant::now() - Duration::from_secs(60)
            });
        }
        store.clean_read_cache();
        let state = store.state.lock().unwrap();
        assert!(state.read_cache.contains_key(&ChunkKey { inode: 1, index: 0 }));
        assert!(!state.read_cache.contains_key(&ChunkKey { inode: 1, index: 1 }));
    }

    #[test]
    fn test_clean_inode_locks_keeps_held_locks() {
        let store = store();
        store.inode_lock(1);
        let held = store.inode_lock(2);
        let _guard = held.lock().unwrap();
        store.clean_inode_locks();
        let state = store.state.lock().unwrap();
        assert!(!state.inode_locks.contains_key(&1));
        assert!(state.inode_locks.contains_key(&2));
    }

    // A minimal HTTP server standing in for metaserver and chunk server, one
    // request per connection.

    type Handler = Box<dyn Fn(&str, &[u8]) -> (u16, Vec<u8>) + Send + Sync>;

    struct MockServer {
        requests: Arc<Mutex<Vec<String>>>
    }

    fn reserve() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn serve(listener: TcpListener, handler: Handler) -> MockServer {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => handle_request(stream, &handler, &log),
                    Err(_) => break
                }
            }
        });
        MockServer { requests: requests }
    }

    fn handle_request(mut stream: TcpStream, handler: &Handler, log: &Mutex<Vec<String>>) {
        let mut reader = BufReader::new(match stream.try_clone() {
            Ok(clone) => clone,
            Err(_) => return
        });
        let mut start_line = String::new();
        if reader.read_line(&mut start_line).is_err() {
            return
        }
        let mut parts = start_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        let mut content_length = 0;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).is_err() {
                return
            }
            let header = header.trim_end().to_lowercase();
            if header.is_empty() {
                break
            }
            if header.starts_with("content-length:") {
                content_length = header["content-length:".len()..].trim().parse().unwrap_or(0);
            }
        }
        let mut body = vec![0u8; content_length];
        if content_length > 0 && reader.read_exact(&mut body).is_err() {
            return
        }
        log.lock().unwrap().push(format!("{} {}", method, path));
        let (status, response) = handler(&path, &body);
        let _ = write!(stream, "HTTP/1.1 {} OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                       status, response.len());
        let _ = stream.write_all(&response);
    }

    fn json_bytes(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    fn store_with_server(port: u16) -> ChunkStore {
        let base_url = format!("http://127.0.0.1:{}", port);
        let meta = Arc::new(MetaClient::new(&base_url, "user", "pass").unwrap());
        ChunkStore::new(meta, ChunkCipher::new([0u8; 32]), "testloc")
    }

    #[test]
    fn test_missing_chunk_reads_as_hole() {
        let (listener, port) = reserve();
        let server = serve(listener, Box::new(|_path, _body| {
            (200, json_bytes(json!({"error": 15, "error_message": "no such chunk"})))
        }));
        let store = store_with_server(port);
        let info = file_info(7, 0, 10);
        assert_eq!(store.read(&info, 0, 5).unwrap(), b"");
        // a hole is not an error: no retries, nothing cached
        assert_eq!(server.requests.lock().unwrap().len(), 1);
        assert!(store.state.lock().unwrap().read_cache.is_empty());
    }

    #[test]
    fn test_checksum_mismatch_retries_download() {
        let cipher = ChunkCipher::new([0u8; 32]);
        let good = cipher.encrypt(7, 0, b"hello");
        let checksum = format!("{:x}", md5::compute(&good));
        let downloads = Arc::new(AtomicUsize::new(0));

        let (listener, port) = reserve();
        let handler_downloads = downloads.clone();
        let _server = serve(listener, Box::new(move |path, _body| {
            if path.starts_with("/client/chunkDownload") {
                (200, json_bytes(json!({
                    "url": format!("http://127.0.0.1:{}/chunk/7.0", port),
                    "checksum": checksum
                })))
            } else if path.starts_with("/chunk/7.0") {
                if handler_downloads.fetch_add(1, Ordering::SeqCst) < 4 {
                    (200, b"garbage".to_vec())
                } else {
                    (200, good.clone())
                }
            } else {
                (404, Vec::new())
            }
        }));

        let store = store_with_server(port);
        let info = file_info(7, 10, 10);
        assert_eq!(store.read(&info, 0, 5).unwrap(), b"hello");
        assert_eq!(downloads.load(Ordering::SeqCst), 5);
        let state = store.state.lock().unwrap();
        assert!(state.read_cache.contains_key(&ChunkKey { inode: 7, index: 0 }));
    }

    #[test]
    fn test_download_gives_up_after_bounded_retries() {
        let (listener, port) = reserve();
        let server = serve(listener, Box::new(|_path, _body| {
            (200, json_bytes(json!({"error": 1, "error_message": "boom"})))
        }));
        let store = store_with_server(port);
        let info = file_info(7, 10, 10);
        assert!(store.read(&info, 0, 5).is_err());
        assert_eq!(server.requests.lock().unwrap().len(), DOWNLOAD_TRIES as usize);
    }

    #[test]
    fn test_flush_uploads_and_finalizes() {
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let finalized = Arc::new(Mutex::new(Vec::new()));
        let size_updates = Arc::new(Mutex::new(Vec::new()));

        let (listener, port) = reserve();
        let handler_uploads = uploads.clone();
        let handler_finalized = finalized.clone();
        let handler_size_updates = size_updates.clone();
        let _server = serve(listener, Box::new(move |path, body| {
            if path.starts_with("/client/chunkUploadInit") {
                (200, json_bytes(json!({
                    "id": 77,
                    "nodes": [{"id": 1, "address": format!("http://127.0.0.1:{}/upload", port)}]
                })))
            } else if path.starts_with("/upload") {
                handler_uploads.lock().unwrap().push(body.to_vec());
                (200, Vec::new())
            } else if path.starts_with("/client/chunkUploadFinalize") {
                handler_finalized.lock().unwrap().push(serde_json::from_slice::<Value>(body).unwrap());
                (200, json_bytes(json!({"success": true})))
            } else if path.starts_with("/client/inodeUpdate") {
                handler_size_updates.lock().unwrap().push(serde_json::from_slice::<Value>(body).unwrap());
                (200, json_bytes(json!({"success": true})))
            } else {
                (404, Vec::new())
            }
        }));

        let store = store_with_server(port);
        let info = file_info(3, 0, 1_000_000);
        seed_read(&store, 3, 0, b"");
        store.write(&info, 0, b"hello").unwrap();
        store.flush(Some(3)).unwrap();

        {
            let state = store.state.lock().unwrap();
            assert!(state.write_buffer.is_empty());
            assert!(state.read_cache.contains_key(&ChunkKey { inode: 3, index: 0 }));
            assert!(state.size_override.is_empty());
        }

        // exactly one upload, ciphertext on the wire
        let payloads = uploads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_ne!(payloads[0], b"hello".to_vec());
        let cipher = ChunkCipher::new([0u8; 32]);
        assert_eq!(cipher.decrypt(3, 0, &payloads[0]), b"hello");

        let finalized = finalized.lock().unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0]["id"], json!(77));
        assert_eq!(finalized[0]["nodes"], json!([1]));

        let size_updates = size_updates.lock().unwrap();
        assert_eq!(size_updates.len(), 1);
        assert_eq!(size_updates[0]["inode"], json!(3));
        assert_eq!(size_updates[0]["size"], json!(5));

        assert_eq!(store.read(&info, 0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_flush_drops_chunks_of_deleted_file() {
        let (listener, port) = reserve();
        let _server = serve(listener, Box::new(|path, _body| {
            if path.starts_with("/client/chunkUploadInit") {
                (200, json_bytes(json!({"error": 2, "error_message": "file not exists"})))
            } else {
                (404, Vec::new())
            }
        }));
        let store = store_with_server(port);
        seed_write(&store, 9, 0, b"data");
        store.flush(Some(9)).unwrap();
        let state = store.state.lock().unwrap();
        assert!(state.write_buffer.is_empty());
        assert!(state.read_cache.is_empty());
    }
}
