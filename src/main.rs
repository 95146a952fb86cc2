#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_json;
extern crate aes;
extern crate base64;
extern crate byteorder;
extern crate cfb_mode;
extern crate daemonize;
extern crate fuse;
extern crate libc;
extern crate md5;
extern crate rand;
extern crate reqwest;
extern crate time;

mod chunks;
mod cli;
mod inode;
mod meta;
mod mount;
mod prelude;

use std::process::exit;

fn main() {
    match cli::run() {
        Ok(()) => exit(0),
        Err(code) => exit(code.code()),
    }
}
