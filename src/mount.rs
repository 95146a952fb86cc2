use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use fuse;
use libc;
use time::Timespec;

use ::prelude::*;

/// Kernel entry/attribute cache lifetime.
const TTL: Timespec = Timespec { sec: 300, nsec: 0 };

const MODE_DIR: u16 = 0o777;
const MODE_FILE: u16 = 0o666;

macro_rules! str_arg(
    ($val:expr, $reply:expr) => {
        match $val.to_str() {
            Some(val) => val,
            None => {
                info!("Error: name is not valid unicode");
                return $reply.error(libc::ENAMETOOLONG);
            }
        }
    }
);

macro_rules! inode_info(
    ($slf:expr, $inode:expr, $reply:expr) => {
        match InodeInfo::by_inode(&$slf.meta, $inode) {
            Ok(info) => info,
            Err(err) => {
                info!("Error: inode {} not available: {}", $inode, err);
                return $reply.error(errno(&err));
            }
        }
    }
);

macro_rules! fh_info(
    ($slf:expr, $fh:expr, $reply:expr) => {
        match $slf.handle($fh) {
            Some(info) => info,
            None => {
                info!("Error: file handle not found: {}", $fh);
                return $reply.error(libc::EBADF);
            }
        }
    }
);

fn errno(err: &InodeError) -> libc::c_int {
    match *err {
        InodeError::NotFound => libc::ENOENT,
        InodeError::Denied => libc::EACCES,
        InodeError::Exists => libc::EEXIST,
        InodeError::Meta(_) => libc::EREMOTEIO
    }
}

fn chunk_errno(err: &ChunkError) -> libc::c_int {
    match *err {
        ChunkError::Download(..) => libc::EREMOTEIO,
        ChunkError::SizeUpdate(_) => libc::EIO
    }
}

#[inline]
fn convert_file_kind(kind: FileKind) -> fuse::FileType {
    match kind {
        FileKind::Directory => fuse::FileType::Directory,
        FileKind::File => fuse::FileType::RegularFile
    }
}

fn millis_to_timespec(millis: u64) -> Timespec {
    Timespec::new((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as i32)
}

fn build_attrs(info: &InodeInfo, size: u64, uid: u32, gid: u32) -> fuse::FileAttr {
    fuse::FileAttr {
        ino: info.inode(),
        size: size,
        blocks: if info.is_dir() { 1 } else { info.chunks_count() },
        atime: Timespec::new(0, 0),
        mtime: millis_to_timespec(info.mtime()),
        ctime: millis_to_timespec(info.ctime()),
        crtime: Timespec::new(0, 0),
        kind: convert_file_kind(info.kind()),
        perm: if info.is_dir() { MODE_DIR } else { MODE_FILE },
        nlink: 1,
        uid: uid,
        gid: gid,
        rdev: 0,
        flags: 0
    }
}

/// Translates kernel operations into inode fetches and chunk store calls.
///
/// File handles (starting at 3) map to the inode snapshot taken at
/// open/opendir time, so a readdir cycle iterates a stable children list.
pub struct EclipFilesystem {
    meta: Arc<MetaClient>,
    store: Arc<ChunkStore>,
    handles: Mutex<HashMap<u64, InodeInfo>>,
    uid: u32,
    gid: u32
}

impl EclipFilesystem {
    pub fn new(meta: Arc<MetaClient>, store: Arc<ChunkStore>) -> Self {
        EclipFilesystem {
            meta: meta,
            store: store,
            handles: Mutex::new(HashMap::new()),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() }
        }
    }

    pub fn mount<P: AsRef<Path>>(self, mountpoint: P, debug_fuse: bool) -> io::Result<()> {
        let mut options = vec!["-o".to_string(), "fsname=eclipfs".to_string(),
                               "-o".to_string(), "allow_other".to_string()];
        if debug_fuse {
            options.push("-o".to_string());
            options.push("debug".to_string());
        }
        let options: Vec<&OsStr> = options.iter().map(|option| option.as_ref()).collect();
        fuse::mount(self, &mountpoint, &options)
    }

    fn attrs(&self, info: &InodeInfo) -> fuse::FileAttr {
        build_attrs(info, self.store.reported_size(info), self.uid, self.gid)
    }

    fn obtain_handle(&self, info: InodeInfo) -> u64 {
        let mut handles = self.handles.lock().unwrap();
        let mut fh = 3;
        while handles.contains_key(&fh) {
            fh += 1;
        }
        debug!("obtain_handle {}", fh);
        handles.insert(fh, info);
        fh
    }

    fn release_handle(&self, fh: u64) {
        debug!("release_handle {}", fh);
        self.handles.lock().unwrap().remove(&fh);
    }

    fn handle(&self, fh: u64) -> Option<InodeInfo> {
        self.handles.lock().unwrap().get(&fh).cloned()
    }
}

impl fuse::Filesystem for EclipFilesystem {
    /// Look up a directory entry by name and get its attributes.
    fn lookup(&mut self, _req: &fuse::Request, parent: u64, name: &OsStr, reply: fuse::ReplyEntry) {
        let name = str_arg!(name, reply);
        let result = match name {
            "." => InodeInfo::by_inode(&self.meta, parent),
            ".." => InodeInfo::by_inode(&self.meta, parent)
                .and_then(|info| InodeInfo::by_inode(&self.meta, info.parent())),
            _ => InodeInfo::by_name(&self.meta, parent, name)
        };
        match result {
            Ok(info) => reply.entry(&TTL, &self.attrs(&info), 0),
            Err(err) => {
                info!("lookup of {} in {} failed: {}", name, parent, err);
                reply.error(errno(&err))
            }
        }
    }

    /// Get file attributes. A pending size override wins over the metaserver
    /// record, so in-flight writes and truncation are visible immediately.
    fn getattr(&mut self, _req: &fuse::Request, ino: u64, reply: fuse::ReplyAttr) {
        let info = inode_info!(self, ino, reply);
        reply.attr(&TTL, &self.attrs(&info));
    }

    fn setattr(&mut self, _req: &fuse::Request, ino: u64, mode: Option<u32>, uid: Option<u32>,
               gid: Option<u32>, size: Option<u64>, atime: Option<Timespec>, mtime: Option<Timespec>,
               _fh: Option<u64>, _crtime: Option<Timespec>, chgtime: Option<Timespec>,
               _bkuptime: Option<Timespec>, _flags: Option<u32>, reply: fuse::ReplyAttr) {
        if mode.is_some() {
            warn!("Ignoring mode change, not supported");
        }
        if uid.is_some() {
            warn!("Ignoring uid change, not supported");
        }
        if gid.is_some() {
            warn!("Ignoring gid change, not supported");
        }
        if atime.is_some() {
            warn!("Ignoring atime change, not supported");
        }
        if chgtime.is_some() {
            warn!("Ignoring ctime change, not supported");
        }

        let lock = self.store.inode_lock(ino);
        let _guard = lock.lock().unwrap();

        let info = inode_info!(self, ino, reply);

        let mut new_size = None;
        if let Some(size) = size {
            let old_size = self.store.reported_size(&info);
            if size > old_size {
                warn!("Enlarging a file via setattr is not supported");
                return reply.error(libc::ENOTSUP);
            } else if size < old_size {
                info!("Shrinking inode {} from {} to {} bytes", ino, old_size, size);
                new_size = Some(size);
            }
        }
        let new_mtime = mtime.map(|t| t.sec as u64 * 1000 + t.nsec as u64 / 1_000_000);

        if new_size.is_some() || new_mtime.is_some() {
            debug!("setattr: updating inode {} (mtime {:?}, size {:?})", ino, new_mtime, new_size);
            if let Err(err) = info.update(&self.meta, new_mtime, new_size) {
                warn!("setattr failed: {}", err);
                return reply.error(libc::EREMOTEIO);
            }
            if new_size.is_some() {
                self.store.clear_override(ino);
            }
        } else {
            debug!("setattr: nothing to do");
        }

        let info = inode_info!(self, ino, reply);
        reply.attr(&TTL, &self.attrs(&info));
    }

    fn readlink(&mut self, _req: &fuse::Request, _ino: u64, reply: fuse::ReplyData) {
        reply.error(libc::ENOTSUP)
    }

    fn symlink(&mut self, _req: &fuse::Request, _parent: u64, _name: &OsStr, _link: &Path,
               reply: fuse::ReplyEntry) {
        reply.error(libc::ENOTSUP)
    }

    fn link(&mut self, _req: &fuse::Request, _ino: u64, _newparent: u64, _newname: &OsStr,
            reply: fuse::ReplyEntry) {
        reply.error(libc::ENOTSUP)
    }

    fn mknod(&mut self, _req: &fuse::Request, _parent: u64, _name: &OsStr, _mode: u32, _rdev: u32,
             reply: fuse::ReplyEntry) {
        reply.error(libc::ENOTSUP)
    }

    fn mkdir(&mut self, _req: &fuse::Request, parent: u64, name: &OsStr, _mode: u32,
             reply: fuse::ReplyEntry) {
        let name = str_arg!(name, reply);
        match InodeInfo::by_mkdir(&self.meta, parent, name) {
            Ok(info) => reply.entry(&TTL, &self.attrs(&info), 0),
            Err(err) => {
                info!("mkdir {} in {} failed: {}", name, parent, err);
                reply.error(errno(&err))
            }
        }
    }

    fn unlink(&mut self, _req: &fuse::Request, parent: u64, name: &OsStr, reply: fuse::ReplyEmpty) {
        let name = str_arg!(name, reply);
        match self.meta.post("inodeDelete", &json!({"inode_p": parent, "name": name})) {
            Ok(_) => {
                debug!("delete done");
                reply.ok()
            }
            Err(err) => match err.code() {
                Some(9) => reply.error(libc::EACCES), // missing write access
                Some(22) | Some(23) | Some(25) => reply.error(libc::ENOENT),
                _ => {
                    warn!("unlink error: {}", err);
                    reply.error(libc::EREMOTEIO)
                }
            }
        }
    }

    fn rmdir(&mut self, _req: &fuse::Request, parent: u64, name: &OsStr, reply: fuse::ReplyEmpty) {
        let name = str_arg!(name, reply);
        match self.meta.post("inodeDelete", &json!({"inode_p": parent, "name": name})) {
            Ok(_) => reply.ok(),
            Err(err) => match err.code() {
                Some(10) => reply.error(libc::ENOTEMPTY), // directory not empty
                Some(9) => reply.error(libc::EACCES),
                Some(22) | Some(23) | Some(25) => reply.error(libc::ENOENT),
                _ => {
                    warn!("rmdir error: {}", err);
                    reply.error(libc::EREMOTEIO)
                }
            }
        }
    }

    fn rename(&mut self, _req: &fuse::Request, parent: u64, name: &OsStr, newparent: u64,
              newname: &OsStr, reply: fuse::ReplyEmpty) {
        let name = str_arg!(name, reply);
        let newname = str_arg!(newname, reply);
        let body = json!({
            "inode_p": parent,
            "name": name,
            "new_parent": newparent,
            "new_name": newname
        });
        match self.meta.post("inodeMove", &body) {
            Ok(_) => reply.ok(),
            Err(err) => match err.code() {
                Some(9) => reply.error(libc::EACCES),  // missing write access
                Some(22) => reply.error(libc::ENOENT), // inode not exists
                Some(23) | Some(24) => reply.error(libc::EEXIST), // target exists
                _ => {
                    warn!("rename error: {}", err);
                    reply.error(libc::EREMOTEIO)
                }
            }
        }
    }

    fn open(&mut self, _req: &fuse::Request, ino: u64, flags: u32, reply: fuse::ReplyOpen) {
        debug!("open inode {}, flags {:o}", ino, flags);
        if flags & (libc::O_CREAT | libc::O_EXCL) as u32 != 0 {
            warn!("O_CREAT/O_EXCL not supported on open");
            return reply.error(libc::ENOTSUP);
        }
        let info = inode_info!(self, ino, reply);
        if info.is_dir() {
            return reply.error(libc::EISDIR);
        }
        if flags & libc::O_TRUNC as u32 != 0 {
            debug!("truncating inode {} on open", ino);
            self.store.truncate(ino);
        }
        reply.opened(self.obtain_handle(info), 0);
    }

    fn create(&mut self, _req: &fuse::Request, parent: u64, name: &OsStr, _mode: u32, _flags: u32,
              reply: fuse::ReplyCreate) {
        let name = str_arg!(name, reply);
        match InodeInfo::by_mkfile(&self.meta, parent, name) {
            Ok(info) => {
                debug!("created file {} (inode {})", info.name(), info.inode());
                let attrs = self.attrs(&info);
                let fh = self.obtain_handle(info);
                reply.created(&TTL, &attrs, 0, fh, 0);
            }
            Err(err) => {
                info!("create {} in {} failed: {}", name, parent, err);
                reply.error(errno(&err))
            }
        }
    }

    fn read(&mut self, _req: &fuse::Request, ino: u64, fh: u64, offset: u64, size: u32,
            reply: fuse::ReplyData) {
        let info = fh_info!(self, fh, reply);
        match self.store.read(&info, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                warn!("read of inode {} failed: {}", ino, err);
                reply.error(chunk_errno(&err))
            }
        }
    }

    fn write(&mut self, _req: &fuse::Request, ino: u64, fh: u64, offset: u64, data: &[u8],
             _flags: u32, reply: fuse::ReplyWrite) {
        let info = fh_info!(self, fh, reply);
        if let Err(err) = self.store.write(&info, offset, data) {
            warn!("write to inode {} failed: {}", ino, err);
            return reply.error(chunk_errno(&err));
        }
        if let Err(err) = self.store.flush(None) {
            error!("flush failed: {}", err);
            return reply.error(chunk_errno(&err));
        }
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &fuse::Request, _ino: u64, _fh: u64, _lock_owner: u64,
             reply: fuse::ReplyEmpty) {
        reply.ok()
    }

    /// Synchronize file contents: a barrier for all chunks of this handle's
    /// inode that were buffered when the call started.
    fn fsync(&mut self, _req: &fuse::Request, _ino: u64, fh: u64, _datasync: bool,
             reply: fuse::ReplyEmpty) {
        debug!("fsync fh {}", fh);
        let info = fh_info!(self, fh, reply);
        match self.store.flush(Some(info.inode())) {
            Ok(()) => reply.ok(),
            Err(err) => {
                error!("flush on fsync failed: {}", err);
                reply.error(chunk_errno(&err))
            }
        }
    }

    fn release(&mut self, _req: &fuse::Request, _ino: u64, fh: u64, _flags: u32, _lock_owner: u64,
               _flush: bool, reply: fuse::ReplyEmpty) {
        debug!("release fh {}", fh);
        let info = fh_info!(self, fh, reply);
        let result = self.store.flush(Some(info.inode()));
        self.release_handle(fh);
        match result {
            Ok(()) => reply.ok(),
            Err(err) => {
                error!("flush on release failed: {}", err);
                reply.error(chunk_errno(&err))
            }
        }
    }

    fn opendir(&mut self, _req: &fuse::Request, ino: u64, _flags: u32, reply: fuse::ReplyOpen) {
        let info = inode_info!(self, ino, reply);
        reply.opened(self.obtain_handle(info), 0);
    }

    /// Read directory entries from the snapshot taken at opendir, so a
    /// readdir cycle is stable; new entries appear on the next opendir.
    fn readdir(&mut self, _req: &fuse::Request, _ino: u64, fh: u64, offset: u64,
               mut reply: fuse::ReplyDirectory) {
        let info = fh_info!(self, fh, reply);
        for (i, entry) in info.children().iter().enumerate() {
            if (i as u64) < offset {
                continue
            }
            if reply.add(entry.inode, i as u64 + 1, convert_file_kind(entry.kind),
                         &Path::new(&entry.name)) {
                break
            }
        }
        reply.ok()
    }

    fn releasedir(&mut self, _req: &fuse::Request, _ino: u64, fh: u64, _flags: u32,
                  reply: fuse::ReplyEmpty) {
        self.release_handle(fh);
        reply.ok()
    }

    fn fsyncdir(&mut self, _req: &fuse::Request, _ino: u64, _fh: u64, _datasync: bool,
                reply: fuse::ReplyEmpty) {
        reply.ok()
    }

    fn statfs(&mut self, _req: &fuse::Request, _ino: u64, reply: fuse::ReplyStatfs) {
        match self.meta.get("statFilesystem", &[]) {
            Ok(response) => {
                let used = response.get("used").and_then(|v| v.as_u64()).unwrap_or(0);
                let free = response.get("free").and_then(|v| v.as_u64()).unwrap_or(0);
                let used_blocks = used / CHUNKSIZE;
                let free_blocks = free / CHUNKSIZE;
                reply.statfs(used_blocks + free_blocks, free_blocks, free_blocks, 0, 0,
                             CHUNKSIZE as u32, 255, CHUNKSIZE as u32);
            }
            Err(err) => {
                warn!("statfs failed: {}", err);
                reply.error(libc::EREMOTEIO)
            }
        }
    }

    fn access(&mut self, _req: &fuse::Request, _ino: u64, _mask: u32, reply: fuse::ReplyEmpty) {
        debug!("access");
        reply.ok()
    }

    fn destroy(&mut self, _req: &fuse::Request) {
        info!("Unmounting");
        self.store.shutdown();
    }
}
