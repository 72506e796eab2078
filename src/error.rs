//! Crate-wide error type.
//!
//! Only failures that are fatal at process init (missing asset root, unwritable cache dir) flow
//! through this type via `?`. Request-level failures (unknown asset, grab conflict, invalid
//! render mode, malformed frame) are ordinary `ServerMessage` replies or logged and dropped —
//! never an `Error`, since a session's mistake should never take the process down.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("asset root {0:?} does not exist")]
    AssetRootMissing(PathBuf),

    #[error("LOD cache directory {0:?} is not writable")]
    CacheDirUnwritable(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
