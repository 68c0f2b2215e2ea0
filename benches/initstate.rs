use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, black_box};

use gpusnap::accel::{patch_instances, InstanceDesc};
use gpusnap::device::{GpuDevice, SoftwareDevice};
use gpusnap::resource::{Format, HeapType, ResourceDesc, ResourceId};
use gpusnap::serialise::{CaptureReader, CaptureWriter};
use gpusnap::sparse::{PageTable, SparseBinds, PAGE_SIZE};
use gpusnap::{EngineConfig, ResourceManager};

fn manager(device: &Arc<SoftwareDevice>, dir: &tempfile::TempDir) -> ResourceManager {
    let config = EngineConfig { disk_cache_dir: Some(dir.path().to_path_buf()), ..Default::default() };
    ResourceManager::new(device.clone(), config).unwrap()
}

/// Manager tracking `count` textures, prepared and flushed
fn prepared_textures(count: usize) -> (Arc<SoftwareDevice>, ResourceManager, tempfile::TempDir) {
    let device = Arc::new(SoftwareDevice::new());
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(&device, &dir);
    let desc = ResourceDesc::texture_2d(128, 128, 1, 4, Format::Rgba8Unorm);
    for _ in 0..count {
        let tex = device.create_resource(&desc, HeapType::Default).unwrap();
        mgr.register_resource(tex, desc, HeapType::Default);
    }
    mgr.prepare_all_initial_states();
    mgr.flush_pending_commands().unwrap();
    (device, mgr, dir)
}

fn bench_prepare_textures(c: &mut Criterion) {
    c.bench_function("prepare_64_textures", |b| {
        b.iter(|| {
            let (_device, mgr, _dir) = prepared_textures(64);
            black_box(mgr.statistics().initial_contents)
        });
    });
}

fn bench_write_capture(c: &mut Criterion) {
    let (_device, mgr, _dir) = prepared_textures(64);

    c.bench_function("write_64_textures", |b| {
        b.iter(|| {
            let mut writer = CaptureWriter::new(Vec::with_capacity(8 << 20)).unwrap();
            mgr.write_initial_states(&mut writer).unwrap();
            black_box(writer.finish().unwrap().len())
        });
    });
}

fn bench_load_and_apply(c: &mut Criterion) {
    let (_device, cap, _dir) = prepared_textures(64);
    let mut writer = CaptureWriter::new(Vec::new()).unwrap();
    cap.write_initial_states(&mut writer).unwrap();
    let bytes = writer.finish().unwrap();

    c.bench_function("load_apply_64_textures", |b| {
        b.iter(|| {
            let device = Arc::new(SoftwareDevice::new());
            let dir = tempfile::tempdir().unwrap();
            let rep = manager(&device, &dir);
            let desc = ResourceDesc::texture_2d(128, 128, 1, 4, Format::Rgba8Unorm);
            for id in cap.ids_with_initial_contents() {
                let tex = device.create_resource(&desc, HeapType::Default).unwrap();
                rep.register_live(
                    id,
                    tex,
                    gpusnap::resource::ResourceDetails::Resource(gpusnap::resource::ResourceInfo::new(
                        desc,
                        HeapType::Default,
                    )),
                );
            }
            let reader = CaptureReader::from_bytes(bytes.clone()).unwrap();
            rep.load_initial_states(&reader).unwrap();
            black_box(rep.apply_all_initial_states().unwrap())
        });
    });
}

fn bench_sparse_compile(c: &mut Criterion) {
    let pages = 10_000u32;
    let mut table = PageTable::for_buffer(u64::from(pages) * PAGE_SIZE);
    for chunk in 0..100u32 {
        table.map_buffer_pages(chunk * 100, 100, ResourceId::new(u64::from(chunk % 3) + 1), u64::from(chunk) * 100 * PAGE_SIZE);
    }

    c.bench_function("sparse_compile_10k_pages", |b| {
        b.iter(|| black_box(SparseBinds::from_page_table(black_box(&table)).len()));
    });
}

fn bench_patch_instances(c: &mut Criterion) {
    let instances: Vec<InstanceDesc> = (0..4096u64)
        .map(|i| InstanceDesc { acceleration_structure: 0x1_0000_0000 + i * 4096, ..Default::default() })
        .collect();
    let bytes: Vec<u8> = bytemuck::cast_slice(&instances).to_vec();

    c.bench_function("patch_4096_instances", |b| {
        b.iter(|| {
            let mut patched = bytes.clone();
            black_box(patch_instances(&mut patched, |address| Ok(address + 0x1000)))
        });
    });
}

criterion_group!(
    benches,
    bench_prepare_textures,
    bench_write_capture,
    bench_load_and_apply,
    bench_sparse_compile,
    bench_patch_instances,
);
criterion_main!(benches);
