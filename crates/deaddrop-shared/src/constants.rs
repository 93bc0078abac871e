/// Pairing code length in characters.
pub const PAIRING_CODE_LEN: usize = 6;

/// Alphabet pairing codes are drawn from (36 symbols, ~2.2e9 code space).
pub const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Attempts to find a non-live pairing code before giving up.
pub const CODE_ALLOC_MAX_ATTEMPTS: usize = 10;

/// Grace before deleting a session that never carried a message or file,
/// once its last client disconnects.
pub const UNUSED_SESSION_GRACE_SECS: u64 = 60;

/// Grace for sessions that saw activity; peers get this long to reconnect.
pub const ACTIVE_SESSION_GRACE_SECS: u64 = 20 * 60;

/// Session sweeper cadence.
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 30;

/// Upload sweeper cadence.
pub const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// In-flight chunked uploads are abandoned after this long without a chunk.
pub const UPLOAD_TTL_SECS: u64 = 24 * 60 * 60;

/// Maximum chunks a single upload may declare.
pub const MAX_UPLOAD_CHUNKS: u32 = 10_000;

/// Maximum text message size in bytes (256 KiB).
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Default per-file size ceiling in bytes (50 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// Default HTTP listen port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
