use hotloop_trace::{CallsiteSnapshot, MAX_STACK_DEPTH};
use std::collections::HashMap;

hotloop_trace::profiler!(cpu = 0);

const MARKER_LEN: usize = 123_457;

#[inline(never)]
fn allocate_marker(len: usize) -> Vec<u8> {
    vec![7u8; len]
}

fn snapshot() -> HashMap<u64, CallsiteSnapshot> {
    let mut sites = Vec::new();
    hotloop_trace::for_each_callsite(|site| sites.push(*site));
    sites.into_iter().map(|site| (site.hash, site)).collect()
}

#[test]
fn test_allocation_and_free_attributed_to_one_callsite() {
    let before = snapshot();
    let buffer = std::hint::black_box(allocate_marker(MARKER_LEN));
    let after = snapshot();

    assert!(hotloop_trace::is_tracking());

    let site = after
        .values()
        .find(|site| {
            let prev = before.get(&site.hash).map_or(0, |b| b.alloc_bytes);
            site.alloc_bytes - prev == MARKER_LEN as u64
        })
        .copied()
        .expect("marker allocation should land on a call site");
    assert!(site.depth > 0);
    assert!(site.live_bytes() >= MARKER_LEN as u64);

    drop(buffer);
    let freed = snapshot();
    let freed_site = freed[&site.hash];
    assert_eq!(freed_site.free_bytes - site.free_bytes, MARKER_LEN as u64);
    assert_eq!(freed_site.free_count - site.free_count, 1);
}

#[test]
fn test_snapshot_accounting_helpers() {
    let mut site = CallsiteSnapshot::new(42);
    assert!(site.frames().is_empty());
    assert!(!site.has_heap_activity());

    site.alloc_count = 3;
    site.alloc_bytes = 300;
    site.free_count = 1;
    site.free_bytes = 100;
    site.depth = 2;
    site.stack[0] = 0x1000;
    site.stack[1] = 0x2000;

    assert_eq!(site.live_count(), 2);
    assert_eq!(site.live_bytes(), 200);
    assert_eq!(site.frames(), &[0x1000, 0x2000]);

    site.depth = MAX_STACK_DEPTH + 10;
    assert_eq!(site.frames().len(), MAX_STACK_DEPTH);
}

#[test]
fn test_over_aligned_allocation_is_aligned() {
    #[repr(align(128))]
    struct Wide([u8; 256]);

    let boxed = Box::new(Wide([1; 256]));
    assert_eq!(&*boxed as *const Wide as usize % 128, 0);
    assert_eq!(boxed.0[255], 1);
}
