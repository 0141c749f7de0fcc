use thiserror::Error;

/// Errors surfaced by the routing table.
///
/// Lookups that simply miss (unknown peer, unknown URI) return `Option`
/// instead of an error; this type covers rejected input and persistence
/// failures only.
#[derive(Debug, Error)]
pub enum TableError {
    /// A peer address with zero bytes was supplied.
    #[error("peer address must not be empty")]
    InvalidAddress,

    /// A URI that does not match `scheme://remainder` was supplied.
    #[error("malformed uri: {0:?}")]
    InvalidUri(String),

    /// `dump`/`load` was called before `set_cache_file`.
    #[error("no cache file configured")]
    NoCacheFile,

    /// Reading or writing the cache file failed.
    #[error("cache file io: {0}")]
    Io(#[from] std::io::Error),

    /// The cache file could not be encoded or decoded (including unknown,
    /// duplicate, or missing snapshot tags).
    #[error("cache file encoding: {0}")]
    Codec(String),

    /// The cache file decoded but its contents violate table invariants.
    #[error("cache file rejected: {0}")]
    Corrupt(String),
}
