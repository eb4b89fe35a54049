//! Stress tests for concurrent registration and device lookup.

mod common;

use common::{MockBackend, manager_with, program, program_with};
use offload::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

/// Concurrent registrations activate each plugin exactly once.
#[test]
fn test_concurrent_registration() {
    let x = Arc::new(MockBackend::new(2, 0xAA));
    let y = Arc::new(MockBackend::new(3, 0xBB));
    let manager = Arc::new(manager_with(&[("x", x), ("y", y)]));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let magic = if i % 2 == 0 { 0xAA } else { 0xBB };
                barrier.wait();
                manager
                    .register_lib(&program(0x10_000 * (i + 1), &[magic]))
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let bindings = handle.join().unwrap();
        assert!(bindings[0].is_bound());
    }

    assert_eq!(manager.num_devices(), 5);
    assert_eq!(manager.num_programs(), 8);
    let names: Vec<String> = manager
        .devices()
        .iter()
        .map(|d| d.plugin_name().to_string())
        .collect();
    // Whichever plugin activated first owns the low numbers.
    assert!(
        names == ["x", "x", "y", "y", "y"] || names == ["y", "y", "y", "x", "x"],
        "unexpected numbering {names:?}"
    );
}

/// Lookups racing with activation never see a number change owner.
#[test]
fn test_lookup_during_activation() {
    let backends: Vec<(String, Arc<MockBackend>)> = (0..6u8)
        .map(|i| (format!("p{i}"), Arc::new(MockBackend::new(2, i + 1))))
        .collect();
    let refs: Vec<(&str, Arc<MockBackend>)> = backends
        .iter()
        .map(|(n, b)| (n.as_str(), Arc::clone(b)))
        .collect();
    let manager = Arc::new(manager_with(&refs));

    let reader = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let mut owners: Vec<Option<String>> = vec![None; 12];
            for _ in 0..2000 {
                let size = manager.num_devices();
                for (n, owner) in owners.iter_mut().enumerate().take(size) {
                    let name = manager.get_device(n).unwrap().plugin_name().to_string();
                    match owner {
                        Some(prev) => assert_eq!(*prev, name),
                        None => *owner = Some(name),
                    }
                }
            }
        })
    };

    for i in 0..6u8 {
        manager
            .register_lib(&program(0x10_000 * (usize::from(i) + 1), &[i + 1]))
            .unwrap();
    }
    reader.join().unwrap();
    assert_eq!(manager.num_devices(), 12);
}

/// Register and unregister cycles from many threads leave nothing behind.
#[test]
fn test_concurrent_register_unregister() {
    let x = Arc::new(MockBackend::new(2, 0xAA));
    let manager = Arc::new(manager_with(&[("x", Arc::clone(&x))]));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for round in 0..50 {
                    let begin = 0x100_000 * (t + 1) + 0x1000 * round;
                    let desc = program_with(
                        begin,
                        &[0xAA],
                        vec![
                            OffloadEntry::ctor("init", begin + 8),
                            OffloadEntry::dtor("fini", begin + 16),
                        ],
                    );
                    manager.register_lib(&desc).unwrap();
                    manager.check_device_and_ctors(round % 2).unwrap();
                    assert!(manager.resolve_entry(round % 2, begin).is_ok());
                    manager.unregister_lib(&desc);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(manager.num_devices(), 2);
    assert_eq!(manager.num_programs(), 0);
    assert_eq!(manager.num_host_ptrs(), 0);
}
