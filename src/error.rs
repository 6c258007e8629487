//! Recoverable error surface.
//!
//! Almost every failure in this crate is fatal by design (see the module-level
//! docs in [`crate::arena`]): OOM, invalid handles, lease underflow and the
//! like abort the process or panic in debug builds, matching a systems-language
//! runtime's expectation that arena allocation never fails gracefully. The two
//! genuinely recoverable surfaces get a typed error instead of a panic.

use thiserror::Error;

/// Errors a caller can reasonably recover from.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Allocation was attempted on a frozen arena from a thread other than
    /// the thread that froze it (shared scope-mode execution).
    #[error("arena is frozen for exclusive use by another thread")]
    FrozenArena,

    /// A malloc-redirect frame's tracked arena exceeded its configured bound
    /// and the frame's policy is non-fatal.
    #[error("malloc-redirect frame exceeded its allocation bound")]
    RedirectOverflow,
}
