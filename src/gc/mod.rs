//! L3' — the cleaner and compactor background threads, and the bounded
//! tree-snapshot they share.

pub(crate) mod cleaner;
pub(crate) mod compactor;

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::arena::{ArenaInner, ManagedArena};

/// Join handles for a root arena's two background threads.
pub(crate) struct GcThreads {
    cleaner: JoinHandle<()>,
    compactor: JoinHandle<()>,
}

impl GcThreads {
    pub(crate) fn join(self) {
        let _ = self.cleaner.join();
        let _ = self.compactor.join();
    }
}

/// Start the cleaner and compactor threads for a freshly created root
/// arena. Only called from [`ManagedArena::create_root`].
pub(crate) fn start_threads(root: &ManagedArena) {
    let cleaner_arena = root.clone();
    let cleaner = std::thread::spawn(move || cleaner::run(cleaner_arena));
    let compactor_arena = root.clone();
    let compactor = std::thread::spawn(move || compactor::run(compactor_arena));
    *root.inner.gc_threads.lock() = Some(GcThreads { cleaner, compactor });
}

/// Breadth-first snapshot of the arena tree rooted at `root`, bounded to
/// `max` arenas (§4.4). `children_mutex` (here, `ArenaInner::children`) is
/// held only while reading each node's child list, never across the whole
/// walk.
pub(crate) fn snapshot_tree(root: &ManagedArena, max: usize) -> Vec<ManagedArena> {
    let mut out = Vec::new();
    let mut queue: std::collections::VecDeque<Arc<ArenaInner>> = std::collections::VecDeque::new();
    queue.push_back(root.inner.clone());
    while let Some(node) = queue.pop_front() {
        if out.len() >= max {
            break;
        }
        let children: Vec<Arc<ArenaInner>> = {
            let guard = node.children.lock();
            guard.iter().filter_map(|w| w.upgrade()).collect()
        };
        out.push(ManagedArena { inner: node });
        for child in children {
            queue.push_back(child);
        }
    }
    out
}
