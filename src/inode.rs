use serde_json::Value;

use ::meta::{MetaClient, MetaError};

/// Fixed chunk size of the store. Do not change this.
pub const CHUNKSIZE: u64 = 1_000_000;

quick_error!{
    #[derive(Debug)]
    pub enum InodeError {
        NotFound {
            description("No such inode")
            display("No such file or directory")
        }
        Denied {
            description("Missing access")
            display("Permission denied")
        }
        Exists {
            description("Name already exists")
            display("Name already exists")
        }
        Meta(err: MetaError) {
            cause(err)
            description("Metaserver error")
            display("Metaserver error: {}", err)
        }
    }
}

fn classify(err: MetaError) -> InodeError {
    match err.code() {
        Some(2) | Some(6) | Some(22) | Some(25) => InodeError::NotFound,
        Some(9) => InodeError::Denied,
        Some(23) | Some(24) => InodeError::Exists,
        _ => InodeError::Meta(err)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
    File,
    Directory
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub inode: u64,
    pub name: String,
    pub kind: FileKind
}

/// Read-only projection of a metaserver inode record.
///
/// A snapshot is fetched per operation that needs metadata and never cached
/// across operations; the only locally authoritative attribute is the size
/// override kept by the chunk store.
#[derive(Clone, Debug)]
pub struct InodeInfo {
    inode: u64,
    name: String,
    path: String,
    parent: u64,
    kind: FileKind,
    size: u64,
    chunk_size: u64,
    mtime: u64,
    ctime: u64,
    children: Vec<DirEntry>
}

impl InodeInfo {
    pub fn by_inode(meta: &MetaClient, inode: u64) -> Result<Self, InodeError> {
        let json = meta.get("inodeInfo", &[("inode", inode.to_string())]).map_err(classify)?;
        InodeInfo::from_value(json).map_err(InodeError::Meta)
    }

    pub fn by_name(meta: &MetaClient, inode_p: u64, name: &str) -> Result<Self, InodeError> {
        let params = [("inode_p", inode_p.to_string()), ("name", name.to_string())];
        let json = meta.get("inodeInfo", &params).map_err(classify)?;
        InodeInfo::from_value(json).map_err(InodeError::Meta)
    }

    pub fn by_mkdir(meta: &MetaClient, inode_p: u64, name: &str) -> Result<Self, InodeError> {
        let json = meta.post("directoryCreate", &json!({"directory": inode_p, "name": name}))
            .map_err(classify)?;
        InodeInfo::from_value(json).map_err(InodeError::Meta)
    }

    pub fn by_mkfile(meta: &MetaClient, inode_p: u64, name: &str) -> Result<Self, InodeError> {
        let json = meta.post("fileCreate", &json!({"directory": inode_p, "name": name}))
            .map_err(classify)?;
        InodeInfo::from_value(json).map_err(InodeError::Meta)
    }

    /// Builds a snapshot from an inode record, which may arrive wrapped in a
    /// `directory` or `file` envelope.
    pub fn from_value(json: Value) -> Result<Self, MetaError> {
        let record = if json.get("directory").map_or(false, Value::is_object) {
            &json["directory"]
        } else if json.get("file").map_or(false, Value::is_object) {
            &json["file"]
        } else {
            &json
        };
        let inode = record.get("inode").and_then(Value::as_u64)
            .ok_or(MetaError::Format("missing inode number"))?;
        let kind = match record.get("type").and_then(Value::as_str) {
            Some("f") => FileKind::File,
            Some("d") => FileKind::Directory,
            _ => return Err(MetaError::Format("missing inode type"))
        };
        let mtime = record.get("mtime").and_then(Value::as_u64).unwrap_or(0);
        let mut children = Vec::new();
        for &(field, child_kind) in &[("directories", FileKind::Directory), ("files", FileKind::File)] {
            if let Some(list) = record.get(field).and_then(Value::as_array) {
                for entry in list {
                    let child_inode = entry.get("inode").and_then(Value::as_u64);
                    let child_name = entry.get("name").and_then(Value::as_str);
                    if let (Some(child_inode), Some(child_name)) = (child_inode, child_name) {
                        children.push(DirEntry {
                            inode: child_inode,
                            name: child_name.to_string(),
                            kind: child_kind
                        });
                    }
                }
            }
        }
        Ok(InodeInfo {
            inode: inode,
            name: record.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
            path: record.get("path").and_then(Value::as_str).unwrap_or("").to_string(),
            parent: record.get("parent").and_then(Value::as_u64).unwrap_or(inode),
            kind: kind,
            size: record.get("size").and_then(Value::as_u64).unwrap_or(0),
            chunk_size: record.get("chunk_size").and_then(Value::as_u64).unwrap_or(CHUNKSIZE),
            mtime: mtime,
            ctime: record.get("ctime").and_then(Value::as_u64).unwrap_or(mtime),
            children: children
        })
    }

    #[inline]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn parent(&self) -> u64 {
        self.parent
    }

    #[inline]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Modification time in milliseconds.
    #[inline]
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Change time in milliseconds.
    #[inline]
    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn chunks_count(&self) -> u64 {
        (self.size + self.chunk_size - 1) / self.chunk_size
    }

    /// Directory children, directories first, in the order the metaserver
    /// listed them.
    pub fn children(&self) -> &[DirEntry] {
        &self.children
    }

    /// Persists attribute changes. Times are in milliseconds.
    pub fn update(&self, meta: &MetaClient, mtime: Option<u64>, size: Option<u64>) -> Result<(), MetaError> {
        let mut body = json!({"inode": self.inode});
        if let Some(mtime) = mtime {
            body["mtime"] = json!(mtime);
        }
        if let Some(size) = size {
            body["size"] = json!(size);
        }
        meta.post("inodeUpdate", &body)?;
        Ok(())
    }
}
