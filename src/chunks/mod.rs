mod cipher;
mod store;

pub use self::cipher::ChunkCipher;
pub use self::store::{ChunkStore, ChunkError, ChunkKey, run_cleaner};
