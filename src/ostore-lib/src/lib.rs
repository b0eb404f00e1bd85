mod checksum;
mod cluster;
mod config;
mod error;
mod hrw;
mod wg;
mod xaction;

pub use checksum::*;
pub use cluster::*;
pub use config::*;
pub use error::*;
pub use hrw::*;
pub use wg::*;
pub use xaction::*;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Default buffer size for streaming file copies.
pub const COPY_BUF_SIZE: usize = 128 * 1024;

/// Unique name of an object within the cluster namespace.
pub fn uname(bucket: &str, objname: &str) -> String {
    format!("{}/{}", bucket, objname)
}
