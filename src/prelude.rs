pub use ::meta::{MetaClient, MetaError};
pub use ::inode::{InodeInfo, InodeError, DirEntry, FileKind, CHUNKSIZE};
pub use ::chunks::{ChunkStore, ChunkError, ChunkKey, ChunkCipher};
