mod args;
pub mod logger;

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use base64;
use daemonize::Daemonize;

use ::chunks::{self, ChunkCipher, ChunkStore};
use ::meta::MetaClient;
use ::mount::EclipFilesystem;

const LOG_FILE: &'static str = "/var/log/eclipfs.log";

pub enum ErrorCode {
    Logger,
    Connect,
    Key,
    Fork,
    Mount
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match *self {
            ErrorCode::Logger => 2,
            ErrorCode::Connect => 3,
            ErrorCode::Key => 4,
            ErrorCode::Fork => 5,
            ErrorCode::Mount => 6
        }
    }
}

pub fn run() -> Result<(), ErrorCode> {
    let options = args::parse();

    let debug = options.debug || env::var_os("DEBUG").is_some();
    let log_file = if options.fork { Some(Path::new(LOG_FILE)) } else { None };
    if logger::init(debug, log_file).is_err() {
        return Err(ErrorCode::Logger)
    }

    let meta = match MetaClient::new(&options.server, &options.username, &options.password) {
        Ok(meta) => Arc::new(meta),
        Err(err) => {
            error!("Failed to set up metaserver client: {}", err);
            return Err(ErrorCode::Connect)
        }
    };

    let key = fetch_encryption_key(&meta)?;

    info!("Started successfully");

    if options.fork {
        info!("Forking for main loop");
        if let Err(err) = Daemonize::new().working_directory("/").umask(0).start() {
            error!("Failed to daemonize: {}", err);
            return Err(ErrorCode::Fork)
        }
    }

    let store = Arc::new(ChunkStore::new(meta.clone(), ChunkCipher::new(key), &options.location));

    // started after daemonizing, threads do not survive the fork
    let cleaner_store = store.clone();
    if let Err(err) = thread::Builder::new().name("cache-cleaner".to_string())
        .spawn(move || chunks::run_cleaner(&cleaner_store)) {
        error!("Failed to spawn cache cleaner: {}", err);
        return Err(ErrorCode::Fork)
    }

    let fs = EclipFilesystem::new(meta, store.clone());
    let result = fs.mount(&options.mountpoint, options.debug_fuse);
    store.shutdown();
    match result {
        Ok(()) => {
            info!("Unmounted cleanly");
            Ok(())
        }
        Err(err) => {
            error!("Mount failed: {}", err);
            Err(ErrorCode::Mount)
        }
    }
}

/// Fetches the 32 byte AES key; this doubles as the connectivity check.
fn fetch_encryption_key(meta: &MetaClient) -> Result<[u8; 32], ErrorCode> {
    let response = match meta.get("getEncryptionKey", &[]) {
        Ok(response) => response,
        Err(err) => {
            error!("Connection error: {}", err);
            return Err(ErrorCode::Connect)
        }
    };
    let encoded = match response.get("key").and_then(|v| v.as_str()) {
        Some(key) => key.to_string(),
        None => {
            error!("Metaserver did not return an encryption key");
            return Err(ErrorCode::Key)
        }
    };
    let bytes = match base64::decode(&encoded) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Encryption key is not valid base64: {}", err);
            return Err(ErrorCode::Key)
        }
    };
    if bytes.len() != 32 {
        error!("Key must be 32 bytes long, it is {} bytes", bytes.len());
        return Err(ErrorCode::Key)
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
