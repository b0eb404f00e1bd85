mod content;
mod iostat;
mod lom;
mod lom_xattr;
mod mountfs;

pub use content::*;
pub use iostat::*;
pub use lom::*;
pub use lom_xattr::*;
pub use mountfs::*;


/// Bucket-locality path segments. These are reserved: a mountpath may not
/// contain them.
pub const LOCAL_BS: &str = "local";
pub const CLOUD_BS: &str = "cloud";

/// Registered content types.
pub const OBJECT_TYPE: &str = "obj";
pub const WORKFILE_TYPE: &str = "work";

/// Workfile role tags.
pub const WORKFILE_PUT: &str = "put";
pub const WORKFILE_EC: &str = "ec";

/// Number of LOM-cache shards per mountpath; shard index is the low 6 bits
/// of the object-name digest.
pub const LOM_CACHE_MASK: u64 = 0x3f;

/// Extended-attribute name carrying the per-object metadata record.
pub const XATTR_LOM: &str = "user.ostore.lom";

/// Extended-attribute name of the bucket-metadata snapshot kept on the
/// selected metadata mountpath.
pub const XATTR_BMD: &str = "user.ostore.bmd";
