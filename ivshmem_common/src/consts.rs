//! Protocol constants and limits for the ivshmem broker.
//!
//! Single source of truth for numeric limits and default paths.
//! Imported by the server and by client-side tooling.

/// Protocol version sent as the very first message on every connection.
pub const IVSHMEM_PROTOCOL_VERSION: i64 = 0;

/// Subject id carried by the region message (denotes no peer).
pub const REGION_SENTINEL_ID: i64 = -1;

/// Size in bytes of one protocol message payload (native-endian `i64`).
pub const MESSAGE_SIZE: usize = 8;

/// Upper bound for region sizing: the largest huge page size (1 GiB).
pub const MAX_REGION_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum number of interrupt vectors per peer.
pub const MAX_VECTORS: u32 = 64;

/// Longest usable Unix socket path in bytes (`sun_path` minus the NUL).
pub const SOCKET_PATH_MAX: usize = 107;

/// Longest usable backing-store path in bytes (`PATH_MAX` minus the NUL).
pub const SHM_PATH_MAX: usize = 4095;

/// Default listening socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ivshmem_socket";

/// Default backing-store name (POSIX shared memory object).
pub const DEFAULT_SHM_PATH: &str = "ivshmem";

/// Default requested region size (4 MiB).
pub const DEFAULT_SHM_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of vectors per peer.
pub const DEFAULT_N_VECTORS: u32 = 1;
