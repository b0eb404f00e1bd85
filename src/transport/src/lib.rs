mod bundle;
mod http;
mod loopback;
mod receive;
mod writers;

pub use bundle::*;
pub use http::*;
pub use loopback::*;
pub use receive::*;
pub use writers::*;

use ostore_lib::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeekExt};

/// Connections multiplexed per peer in one stream bundle.
pub const INTRA_BUNDLE_MULTIPLIER: usize = 4;

/// Per-object attributes carried in every intra-target header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub size: i64,
    pub version: String,
    pub atime_ns: i64,
    pub cksum_type: String,
    pub cksum_value: String,
}

/// The opaque-header message envelope of both stream bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub bucket: String,
    pub objname: String,
    /// A marshalled request descriptor; the transport never interprets it.
    #[serde(default)]
    pub opaque: Vec<u8>,
    #[serde(default)]
    pub obj_attrs: ObjectAttrs,
}

pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// A body that can be (re)opened once per destination, so one logical send
/// can fan out to several peers.
#[derive(Clone)]
pub enum SendBody {
    None,
    Bytes(Arc<Vec<u8>>),
    File(PathBuf),
    /// (path, offset, length)
    FileRange(PathBuf, u64, u64),
}

impl SendBody {
    pub fn size(&self) -> i64 {
        match self {
            SendBody::None => 0,
            SendBody::Bytes(b) => b.len() as i64,
            SendBody::File(path) => std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0),
            SendBody::FileRange(_, _, len) => *len as i64,
        }
    }

    pub async fn open(&self) -> StoreResult<Option<BodyReader>> {
        match self {
            SendBody::None => Ok(None),
            SendBody::Bytes(bytes) => {
                Ok(Some(Box::new(std::io::Cursor::new(bytes.to_vec()))))
            }
            SendBody::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| StoreError::Io(format!("open {}: {}", path.display(), e)))?;
                Ok(Some(Box::new(file)))
            }
            SendBody::FileRange(path, offset, len) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| StoreError::Io(format!("open {}: {}", path.display(), e)))?;
                file.seek(std::io::SeekFrom::Start(*offset))
                    .await
                    .map_err(|e| StoreError::Io(format!("seek {}: {}", path.display(), e)))?;
                Ok(Some(Box::new(tokio::io::AsyncReadExt::take(file, *len))))
            }
        }
    }
}

/// Invoked once per destination when its send completes.
pub type SendCallback = Arc<dyn Fn(&Header, Option<&StoreError>) + Send + Sync>;
