use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::thread;

use log::{self, Level, LevelFilter, Log, Metadata, Record};
pub use log::SetLoggerError;

use time;

struct Logger {
    level: Level,
    file: Option<Mutex<File>>
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return
        }
        let timestamp = time::now().strftime("%Y-%m-%d %H:%M:%S")
            .map(|t| t.to_string()).unwrap_or_default();
        let thread = thread::current();
        let line = format!("{} {}: [{}] {}", timestamp, thread.name().unwrap_or("?"),
                           record.level(), record.args());
        match self.file {
            Some(ref file) => {
                let _ = writeln!(file.lock().unwrap(), "{}", line);
            }
            None => eprintln!("{}", line)
        }
    }

    fn flush(&self) {}
}

pub fn init(debug: bool, log_file: Option<&Path>) -> Result<(), SetLoggerError> {
    let level = if debug { Level::Debug } else { Level::Info };
    let file = match log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(err) => {
                eprintln!("Failed to open log file {:?}: {}, logging to stderr", path, err);
                None
            }
        },
        None => None
    };
    log::set_boxed_logger(Box::new(Logger { level: level, file: file }))?;
    log::set_max_level(if debug { LevelFilter::Debug } else { LevelFilter::Info });
    Ok(())
}
