//! Device registry and registration benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use offload::affinity::StaticTopology;
use offload::error::BackendError;
use offload::image::{DeviceImage, TargetEntry, TargetTable};
use offload::prelude::*;
use std::sync::Arc;

struct NullBackend {
    devices: u32,
}

impl Backend for NullBackend {
    fn number_of_devices(&self) -> u32 {
        self.devices
    }

    fn is_valid_binary(&self, image: &DeviceImage) -> bool {
        !image.binary().is_empty()
    }

    fn init_device(&self, _device: u32) -> BackendResult {
        Ok(())
    }

    fn deinit_device(&self, _device: u32) -> BackendResult {
        Ok(())
    }

    fn load_binary(&self, _device: u32, image: &DeviceImage) -> BackendResult<TargetTable> {
        if image.entries().is_empty() {
            return Err(BackendError::FAIL);
        }
        Ok(TargetTable {
            entries: image
                .entries()
                .iter()
                .map(|e| TargetEntry {
                    name: e.name.clone(),
                    device_addr: e.addr as u64,
                    size: e.size,
                })
                .collect(),
        })
    }

    fn launch_kernel(&self, _device: u32, _entry: &OffloadEntry) -> BackendResult {
        Ok(())
    }

    fn synchronize(&self, _device: u32) -> BackendResult {
        Ok(())
    }

    fn device_numa_node(&self, device: u32) -> Option<usize> {
        Some(device as usize % 2)
    }
}

fn program(begin: usize, entries: usize) -> BinaryDescriptor {
    let entries: Vec<OffloadEntry> = (0..entries)
        .map(|i| OffloadEntry::function(format!("kernel_{i}"), begin + i * 8))
        .collect();
    BinaryDescriptor::new(
        HostEntryRange::new(begin, begin + entries.len() * 8),
        entries.clone(),
        vec![ImageDescriptor::new(vec![1u8, 2, 3, 4], entries)],
    )
}

fn manager(devices: u32) -> PluginManager {
    let manager = PluginManager::new(ManagerConfig::empty().with_numa_affinity(true))
        .with_topology(Arc::new(StaticTopology::new(vec![
            vec![10, 21],
            vec![21, 10],
        ])));
    manager
        .add_backend("null", Arc::new(NullBackend { devices }))
        .expect("backend accepted");
    manager
}

fn bench_get_device(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_device");

    for devices in [1u32, 8, 64] {
        let manager = manager(devices);
        manager.init_all_plugins();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(devices), &manager, |b, m| {
            let last = m.num_devices() - 1;
            b.iter(|| std::hint::black_box(m.get_device(last).expect("device exists")));
        });
    }

    group.finish();
}

fn bench_register_unregister(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_unregister");

    for entries in [1usize, 16, 256] {
        let manager = manager(4);
        let desc = program(0x10_0000, entries);

        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &desc, |b, desc| {
            b.iter(|| {
                manager.register_lib(desc).expect("registration succeeds");
                std::hint::black_box(manager.unregister_lib(desc));
            });
        });
    }

    group.finish();
}

fn bench_resolve_entry(c: &mut Criterion) {
    let manager = manager(4);
    let desc = program(0x10_0000, 64);
    manager.register_lib(&desc).expect("registration succeeds");
    let addr = 0x10_0000 + 63 * 8;

    c.bench_function("resolve_entry_cached", |b| {
        b.iter(|| std::hint::black_box(manager.resolve_entry(3, addr).expect("entry resolves")));
    });
}

fn bench_devices_in_order(c: &mut Criterion) {
    let manager = manager(64);
    manager.init_all_plugins();
    let mut out = vec![0; 64];

    c.bench_function("devices_in_order_64", |b| {
        b.iter(|| std::hint::black_box(manager.devices_in_order(1, 64, &mut out)));
    });
}

criterion_group!(
    benches,
    bench_get_device,
    bench_register_unregister,
    bench_resolve_entry,
    bench_devices_in_order
);
criterion_main!(benches);
