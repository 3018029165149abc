//! Default sizes, caps and timeouts
//!
//! These values back [`ClientOptions::default`](crate::ClientOptions) and the
//! buffer pools. All of them can be overridden per client.

// ============================================================================
// Buffer pool
// ============================================================================

/// Size of one receive block (64 KiB).
///
/// One transport read fills at most one block, so this is also the largest
/// chunk the receive loop hands to the pipeline at once.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Idle blocks kept by a pool once they are released.
pub const DEFAULT_MAX_RETAINED_BLOCKS: usize = 10;

// ============================================================================
// Timeouts
// ============================================================================

/// Default wait for a correlated reply (milliseconds).
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 3000;
