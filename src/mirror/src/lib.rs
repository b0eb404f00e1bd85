mod utils;
mod xact_copy;

pub use utils::*;
pub use xact_copy::*;

#[cfg(test)]
mod mirror_tests;

pub const XACT_MIRROR_KIND: &str = "mirror";
