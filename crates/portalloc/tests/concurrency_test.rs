//! Concurrency tests for the port allocator

use common::Error;
use portalloc::{PortAllocator, PortAllocatorConfig, PortRange};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};

/// Allocator whose "api" range holds exactly `size` ports
fn allocator_with_api_range(size: u16) -> Arc<PortAllocator> {
    let config = PortAllocatorConfig::default()
        .with_range("api", PortRange::new(20000, 20000 + size - 1));
    Arc::new(PortAllocator::new(config))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_allocations_are_unique() {
    const CALLERS: u16 = 64;
    let allocator = allocator_with_api_range(CALLERS);

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate(&format!("svc-{i}"), Some("api")) })
        })
        .collect();

    let mut ports = HashSet::new();
    for handle in handles {
        let port = handle.await.unwrap().expect("range sized for every caller");
        assert!(ports.insert(port), "port {port} handed out twice");
    }

    assert_eq!(ports.len(), usize::from(CALLERS));
    assert!(ports.iter().all(|p| (20000..20000 + CALLERS).contains(p)));

    // Range is now full
    let err = allocator.allocate("one-too-many", Some("api")).unwrap_err();
    assert!(matches!(err, Error::PortRangeExhausted { ref range } if range == "api"));
}

#[test]
fn test_threads_racing_on_small_range() {
    // More callers than ports: winners are unique, losers get a typed error
    let allocator = allocator_with_api_range(8);

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let allocator = allocator.clone();
            std::thread::spawn(move || allocator.allocate(&format!("svc-{i}"), Some("api")))
        })
        .collect();

    let mut ports = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(port) => assert!(ports.insert(port)),
            Err(Error::PortRangeExhausted { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(ports.len(), 8);
    assert_eq!(exhausted, 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_and_reallocate_under_contention() {
    let allocator = allocator_with_api_range(4);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                let name = format!("churn-{i}");
                for _ in 0..50 {
                    if let Ok(port) = allocator.allocate(&name, Some("api")) {
                        assert_eq!(allocator.allocation(port).unwrap().service_name, name);
                        allocator.release(port);
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(allocator.list_allocations().is_empty());
}

/// Lease `svc` from `callers` threads at once; the first `committers` commit
fn racing_leases(callers: usize, committers: usize) -> (Arc<PortAllocator>, Vec<(u16, bool)>) {
    let allocator = allocator_with_api_range(4);
    let before = Arc::new(Barrier::new(callers));
    let held = Arc::new(Barrier::new(callers));

    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let allocator = allocator.clone();
            let before = before.clone();
            let held = held.clone();
            std::thread::spawn(move || {
                before.wait();
                let lease = allocator.lease("svc", Some("api")).unwrap();
                let seen = (lease.port(), lease.is_fresh());
                // Every lease is outstanding before any of them ends
                held.wait();
                if i < committers {
                    lease.commit();
                }
                seen
            })
        })
        .collect();

    let seen = handles.into_iter().map(|h| h.join().unwrap()).collect();
    (allocator, seen)
}

#[test]
fn test_concurrent_leases_share_one_port() {
    let (allocator, seen) = racing_leases(16, 1);

    assert_eq!(seen.iter().filter(|(_, fresh)| *fresh).count(), 1);
    assert!(seen.iter().all(|(port, _)| *port == 20000));
    assert_eq!(allocator.port_for_service("svc"), Some(20000));
    assert_eq!(allocator.list_allocations().len(), 1);
}

#[test]
fn test_concurrent_uncommitted_leases_release_port() {
    let (allocator, seen) = racing_leases(16, 0);

    assert_eq!(seen.iter().filter(|(_, fresh)| *fresh).count(), 1);
    assert_eq!(allocator.port_for_service("svc"), None);
    assert!(allocator.is_port_available(20000));
}
