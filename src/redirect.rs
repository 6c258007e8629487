//! Optional malloc-redirect extension (§6): a thread-local stack of
//! `{arena, policy}` frames modeling interception of `malloc`/`free`/
//! `realloc`/`calloc`. Each redirected allocation carries a header
//! immediately preceding the user pointer and is tracked in a per-frame set
//! of live user pointers.
//!
//! Installing the actual hook (PLT rewriting on Linux, two-level namespace
//! rebinding on macOS, trampolines on Windows) is a platform-specific,
//! external-collaborator concern per §1 — this module is the
//! architecture-agnostic policy/bookkeeping layer underneath it.

use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::arena::ManagedArena;
use crate::error::ArenaError;
use crate::handle::HANDLE_NULL;

const REDIRECT_MAGIC: u32 = u32::from_be_bytes(*b"ARNA");

/// Header immediately preceding every redirected user pointer.
#[repr(C)]
#[derive(Clone, Copy)]
struct RedirectHeader {
    size: usize,
    magic: u32,
    flags: u32,
}

/// What `free` does when handed a pointer this frame redirected.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FreePolicy {
    Ignore,
    Track,
    Warn,
    Abort,
}

/// What happens when a frame's tracked allocation total would exceed its
/// configured bound.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OverflowPolicy {
    Grow,
    FallBackToSystem,
    ReturnNull,
    Abort,
}

/// Per-frame policy knobs.
///
/// **Resolution of the open question on zeroing** (`SPEC_FULL.md` §9):
/// `zero_on_free` defaults to `false` — the security benefit of zeroing a
/// simulated free is judged not worth the cost for the common case, exactly
/// as for a real allocator.
#[derive(Clone, Copy)]
pub struct RedirectPolicy {
    pub free_policy: FreePolicy,
    pub overflow_policy: OverflowPolicy,
    pub zero_on_free: bool,
    pub bound: Option<usize>,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            free_policy: FreePolicy::Track,
            overflow_policy: OverflowPolicy::Grow,
            zero_on_free: false,
            bound: None,
        }
    }
}

struct RedirectFrame {
    arena: ManagedArena,
    policy: RedirectPolicy,
    tracked: FxHashSet<usize>,
    bytes_allocated: usize,
}

thread_local! {
    static FRAMES: RefCell<Vec<RedirectFrame>> = const { RefCell::new(Vec::new()) };
}

/// Push a redirect frame for the current thread; every [`redirect_malloc`]
/// call until the matching [`pop_frame`] routes through `arena`.
///
/// A thread-local guard (implicit in frame-per-thread scoping) keeps
/// allocations made *by this module itself* — e.g. growing the frame's
/// tracked-pointer set — from re-entering the redirect path: those use the
/// ordinary system allocator via `FxHashSet`, never `arena`.
pub fn push_frame(arena: ManagedArena, policy: RedirectPolicy) {
    FRAMES.with(|f| {
        f.borrow_mut().push(RedirectFrame {
            arena,
            policy,
            tracked: FxHashSet::default(),
            bytes_allocated: 0,
        })
    });
}

/// Pop the current thread's innermost redirect frame.
pub fn pop_frame() {
    FRAMES.with(|f| {
        f.borrow_mut().pop();
    });
}

fn header_size() -> usize {
    std::mem::size_of::<RedirectHeader>()
}

/// Simulated `malloc`. `Ok(None)` means "fall through to the system
/// allocator" (no active frame, or the frame's overflow policy is
/// [`OverflowPolicy::FallBackToSystem`]); `Ok(Some(ptr))` may itself be
/// null under [`OverflowPolicy::ReturnNull`].
pub fn redirect_malloc(size: usize) -> Result<Option<*mut u8>, ArenaError> {
    FRAMES.with(|f| {
        let mut frames = f.borrow_mut();
        let Some(frame) = frames.last_mut() else {
            return Ok(None);
        };
        let total = header_size() + size;
        if let Some(bound) = frame.policy.bound {
            if frame.bytes_allocated + total > bound {
                return match frame.policy.overflow_policy {
                    OverflowPolicy::Grow => Ok(Some(do_alloc(frame, size, total))),
                    OverflowPolicy::FallBackToSystem => Ok(None),
                    OverflowPolicy::ReturnNull => Ok(Some(std::ptr::null_mut())),
                    OverflowPolicy::Abort => Err(ArenaError::RedirectOverflow),
                };
            }
        }
        Ok(Some(do_alloc(frame, size, total)))
    })
}

fn do_alloc(frame: &mut RedirectFrame, size: usize, total: usize) -> *mut u8 {
    let h = frame.arena.alloc(HANDLE_NULL, total);
    let base = frame.arena.pin(h);
    unsafe {
        *(base as *mut RedirectHeader) = RedirectHeader {
            size,
            magic: REDIRECT_MAGIC,
            flags: 0,
        };
    }
    let user_ptr = unsafe { base.add(header_size()) };
    frame.tracked.insert(user_ptr as usize);
    frame.bytes_allocated += total;
    user_ptr
}

/// Simulated `free`. A pointer this frame did not hand out is silently
/// ignored (it belongs to the system allocator or an outer frame).
pub fn redirect_free(ptr: *mut u8) {
    FRAMES.with(|f| {
        let mut frames = f.borrow_mut();
        let Some(frame) = frames.last_mut() else {
            return;
        };
        let key = ptr as usize;
        if !frame.tracked.contains(&key) {
            return;
        }
        match frame.policy.free_policy {
            FreePolicy::Ignore => return,
            FreePolicy::Track => {
                frame.tracked.remove(&key);
            }
            FreePolicy::Warn => {
                #[cfg(feature = "gc_logging")]
                tracing::warn!(ptr = key, "redirect_free: freeing a redirected pointer");
                frame.tracked.remove(&key);
            }
            FreePolicy::Abort => {
                panic!("malloc-redirect: free of a redirected pointer under the Abort policy");
            }
        }
        if frame.policy.zero_on_free {
            let header = unsafe { &*(ptr.sub(header_size()) as *const RedirectHeader) };
            unsafe { std::ptr::write_bytes(ptr, 0, header.size) };
        }
    });
}

/// Whether `ptr` was handed out by the current thread's innermost frame.
pub fn is_redirected(ptr: *mut u8) -> bool {
    FRAMES.with(|f| {
        f.borrow()
            .last()
            .is_some_and(|frame| frame.tracked.contains(&(ptr as usize)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirected_alloc_is_tracked_and_freed() {
        let arena = ManagedArena::create_root();
        push_frame(arena.clone(), RedirectPolicy::default());
        let ptr = redirect_malloc(32).unwrap().unwrap();
        assert!(!ptr.is_null());
        assert!(is_redirected(ptr));
        redirect_free(ptr);
        assert!(!is_redirected(ptr));
        pop_frame();
        arena.destroy();
    }

    #[test]
    fn overflow_abort_policy_surfaces_as_error() {
        let arena = ManagedArena::create_root();
        push_frame(
            arena.clone(),
            RedirectPolicy {
                bound: Some(8),
                overflow_policy: OverflowPolicy::Abort,
                ..RedirectPolicy::default()
            },
        );
        let result = redirect_malloc(64);
        assert!(matches!(result, Err(ArenaError::RedirectOverflow)));
        pop_frame();
        arena.destroy();
    }

    #[test]
    fn no_active_frame_falls_through() {
        assert!(redirect_malloc(16).unwrap().is_none());
    }
}
