//! End-to-end scenarios and universal invariants for the managed arena,
//! its array/string layers, and cross-arena promotion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use managed_arena::array::{self, TypedArray};
use managed_arena::string;
use managed_arena::{ArenaConfig, ManagedArena, HANDLE_NULL};

#[test]
fn s1_simple_push_pop_round_trip() {
    let a = ManagedArena::create_root();
    let h = TypedArray::<i64>::create(&a, &[10, 20, 30]);
    assert_eq!(TypedArray::<i64>::length(&a, h), 3);
    assert_eq!(TypedArray::<i64>::get(&a, h, 2), 30);

    let h = TypedArray::<i64>::push(&a, h, 40);
    assert_eq!(TypedArray::<i64>::length(&a, h), 4);
    assert_eq!(TypedArray::<i64>::get(&a, h, 3), 40);

    let v = TypedArray::<i64>::pop(&a, h);
    assert_eq!(v, 40);
    assert_eq!(TypedArray::<i64>::length(&a, h), 3);

    a.destroy();
}

#[test]
fn s2_growth_past_capacity_changes_handle_but_preserves_contents() {
    let a = ManagedArena::create_root();
    let mut h = TypedArray::<u8>::create(&a, &[0, 0, 0, 0]);
    for b in [1u8, 2, 3, 4, 5] {
        h = TypedArray::<u8>::push(&a, h, b);
    }
    let data: Vec<u8> = (0..TypedArray::<u8>::length(&a, h))
        .map(|i| TypedArray::<u8>::get(&a, h, i))
        .collect();
    assert_eq!(data, vec![0, 0, 0, 0, 1, 2, 3, 4, 5]);
    a.destroy();
}

#[test]
fn s3_fragmentation_triggers_compaction() {
    let config = ArenaConfig {
        compact_threshold: 0.1,
        compactor_interval: Duration::from_millis(5),
        cleaner_interval: Duration::from_millis(5),
        ..ArenaConfig::default()
    };
    let a = ManagedArena::create_root_with_config(config);

    let mut handles = Vec::with_capacity(1000);
    for _ in 0..1000 {
        handles.push(a.alloc(HANDLE_NULL, 1024));
    }
    let before = a.total_allocated();

    for h in handles.iter().take(900) {
        a.mark_dead(*h);
    }

    a.force_compact();

    let after = a.total_allocated();
    assert!(
        after <= before / 5,
        "expected total_allocated to drop by at least 80%: before={before} after={after}"
    );

    a.destroy();
}

#[test]
fn s4_permanent_pin_survives_compaction() {
    let config = ArenaConfig {
        compact_threshold: 0.1,
        ..ArenaConfig::default()
    };
    let a = ManagedArena::create_root_with_config(config);

    let h = a.alloc(HANDLE_NULL, 64);
    let p = a.pin_permanent(h);
    unsafe { *p = 0xAB };

    for _ in 0..200 {
        let junk = a.alloc(HANDLE_NULL, 8 * 1024);
        a.mark_dead(junk);
    }
    a.gc_flush();

    assert_eq!(unsafe { *p }, 0xAB);
    let p_after = a.pin_permanent(h);
    assert_eq!(p_after, p);

    a.destroy();
}

#[test]
fn s5_child_promote_preserves_value_marks_source_dead() {
    let root = ManagedArena::create_root();
    let child = root.create_child();

    let h = string::strdup(&child, HANDLE_NULL, "hello");
    let h2 = ManagedArena::promote(&root, &child, h);

    let bytes_ok = {
        let p = root.pin(h2);
        let bytes = unsafe { std::slice::from_raw_parts(p, 6) };
        bytes == b"hello\0"
    };
    root.unpin(h2);
    assert!(bytes_ok);

    child.destroy_child();

    let p = root.pin(h2);
    assert!(!p.is_null());
    root.unpin(h2);

    root.destroy();
}

#[test]
fn s6_2d_string_array_round_trips_across_promotion() {
    let root = ManagedArena::create_root();
    let child = root.create_child();

    let a1 = string::strdup(&child, HANDLE_NULL, "a");
    let b1 = string::strdup(&child, HANDLE_NULL, "b");
    let inner1 = TypedArray::<managed_arena::Handle>::create(&child, &[a1, b1]);

    let c1 = string::strdup(&child, HANDLE_NULL, "c");
    let inner2 = TypedArray::<managed_arena::Handle>::create(&child, &[c1]);

    let outer = TypedArray::<managed_arena::Handle>::create(&child, &[inner1, inner2]);

    let promoted = array::promote_string_array2(&root, &child, outer);
    child.destroy_child();

    let outer_len = TypedArray::<managed_arena::Handle>::length(&root, promoted);
    assert_eq!(outer_len, 2);

    let mut pieces = Vec::new();
    for i in 0..outer_len {
        let inner = TypedArray::<managed_arena::Handle>::get(&root, promoted, i);
        pieces.push(string::array_join(&root, inner, "|"));
    }
    assert_eq!(pieces.join(";"), "a|b;c");

    root.destroy();
}

#[test]
fn invariant_array_push_length_and_last_element() {
    let a = ManagedArena::create_root();
    let h = TypedArray::<i64>::create(&a, &[1, 2]);
    let before_len = TypedArray::<i64>::length(&a, h);
    let h = TypedArray::<i64>::push(&a, h, 99);
    assert_eq!(TypedArray::<i64>::length(&a, h), before_len + 1);
    assert_eq!(
        TypedArray::<i64>::get(&a, h, TypedArray::<i64>::length(&a, h) - 1),
        99
    );
    a.destroy();
}

#[test]
fn invariant_any_round_trip() {
    let a = ManagedArena::create_root();
    let arr = TypedArray::<i64>::create(&a, &[7, 8, 9]);
    let boxed = managed_arena::any::to_any_long(&a, arr);
    let back = managed_arena::any::from_any_long(&a, boxed);
    assert_eq!(TypedArray::<i64>::length(&a, back), 3);
    for i in 0..3 {
        assert_eq!(
            TypedArray::<i64>::get(&a, back, i),
            TypedArray::<i64>::get(&a, arr, i)
        );
    }
    a.destroy();
}

#[test]
fn invariant_string_concat_matches_bytes_and_length() {
    let a = ManagedArena::create_root();
    let h = string::concat(&a, HANDLE_NULL, "foo", "bar");
    assert_eq!(string::length(&a, h), 6);
    a.destroy();
}

#[test]
fn invariant_reset_runs_cleanups_in_priority_order_and_clears_live_count() {
    let a = ManagedArena::create_root();
    let _ = a.alloc(HANDLE_NULL, 16);
    let _ = a.alloc(HANDLE_NULL, 32);
    assert!(a.live_count() > 0);

    let order: Arc<std::sync::Mutex<Vec<i32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_a = order.clone();
    let order_b = order.clone();
    a.register_cleanup(1, 10, Box::new(move || order_a.lock().unwrap().push(10)));
    a.register_cleanup(2, 5, Box::new(move || order_b.lock().unwrap().push(5)));

    a.reset();

    assert_eq!(a.live_count(), 0);
    assert_eq!(*order.lock().unwrap(), vec![5, 10]);

    a.destroy();
}

#[test]
fn invariant_consecutive_allocations_are_disjoint() {
    let a = ManagedArena::create_root();
    let h1 = a.alloc(HANDLE_NULL, 128);
    let h2 = a.alloc(HANDLE_NULL, 128);
    let p1 = a.pin(h1);
    let p2 = a.pin(h2);
    let r1 = p1 as usize..(p1 as usize + 128);
    let r2 = p2 as usize..(p2 as usize + 128);
    assert!(r1.end <= r2.start || r2.end <= r1.start);
    a.unpin(h1);
    a.unpin(h2);
    a.destroy();
}

#[test]
fn cleaner_and_compactor_threads_make_progress_without_panicking() {
    let a = ManagedArena::create_root();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let h = a.alloc(HANDLE_NULL, 256);
        a.mark_dead(h);
        count.fetch_add(1, Ordering::Relaxed);
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::Relaxed), 200);
    a.destroy();
}
