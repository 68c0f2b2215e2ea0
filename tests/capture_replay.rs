//! Capture on one device, replay on another

use std::sync::Arc;

use gpusnap::accel::{AddressAndStride, AsType, BuildInputs, GeometryDesc, GeometryKind, InstanceDesc, TrianglesDesc};
use gpusnap::device::{GpuCommand, GpuDevice, SoftwareDevice};
use gpusnap::initstate::{CaptureState, ContentsTag, ResourceManager};
use gpusnap::resource::{
    Descriptor, DescriptorHeapKind, Format, HeapType, ResourceDesc, ResourceDetails, ResourceFlags, ResourceId,
    ResourceInfo, ViewDesc,
};
use gpusnap::serialise::{CaptureReader, CaptureWriter, WriteSerialiser};
use gpusnap::sparse::{PageTable, SparseBinds, PAGE_SIZE};
use gpusnap::{EngineConfig, NativeHandle, ResultCode};

struct Side {
    device: Arc<SoftwareDevice>,
    mgr: ResourceManager,
    _dir: tempfile::TempDir,
}

fn side_with(config: EngineConfig) -> Side {
    gpusnap::core::logging::init_for_tests();
    let device = Arc::new(SoftwareDevice::new());
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { disk_cache_dir: Some(dir.path().to_path_buf()), ..config };
    let mgr = ResourceManager::new(device.clone(), config).unwrap();
    Side { device, mgr, _dir: dir }
}

fn side() -> Side {
    side_with(EngineConfig::default())
}

/// Replay side whose buffers land at different addresses than the capture side
fn replay_side_with(config: EngineConfig) -> Side {
    let side = side_with(config);
    side.device.create_resource(&ResourceDesc::buffer(3 * 65536), HeapType::Default).unwrap();
    side
}

fn capture(side: &Side, version: u32) -> Vec<u8> {
    side.mgr.set_state(CaptureState::ActiveCapturing);
    side.mgr.prepare_all_initial_states();
    let mut writer = CaptureWriter::with_version(Vec::new(), version).unwrap();
    side.mgr.write_initial_states(&mut writer).unwrap();
    writer.finish().unwrap()
}

/// Create a live copy of a captured resource and register it under the captured id
fn recreate(side: &Side, id: ResourceId, desc: ResourceDesc, heap: HeapType) -> NativeHandle {
    let handle = side.device.create_resource(&desc, heap).unwrap();
    side.mgr.register_live(id, handle, ResourceDetails::Resource(ResourceInfo::new(desc, heap)));
    handle
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_buffers_round_trip() {
    let cap = side();
    let desc = ResourceDesc::buffer(1024);
    let gpu = cap.device.create_resource(&desc, HeapType::Default).unwrap();
    cap.device.fill_buffer(gpu, 0, &pattern(1024, 1)).unwrap();
    let gpu_id = cap.mgr.register_resource(gpu, desc, HeapType::Default);

    let rb_desc = ResourceDesc::buffer(16);
    let readback = cap.device.create_resource(&rb_desc, HeapType::Readback).unwrap();
    cap.device.fill_buffer(readback, 0, &[7; 16]).unwrap();
    let rb_id = cap.mgr.register_resource(readback, rb_desc, HeapType::Readback);

    let upload_desc = ResourceDesc::buffer(100);
    let upload = cap.device.create_resource(&upload_desc, HeapType::Upload).unwrap();
    cap.device.fill_buffer(upload, 0, &pattern(100, 9)).unwrap();
    let upload_id = cap.mgr.register_resource(upload, upload_desc, HeapType::Upload);

    let bytes = capture(&cap, gpusnap::serialise::CURRENT_VERSION);
    assert_eq!(cap.mgr.initial_contents_tag(rb_id), Some(ContentsTag::MapDirect));

    let rep = replay_side_with(EngineConfig::default());
    let live_gpu = recreate(&rep, gpu_id, desc, HeapType::Default);
    let live_rb = recreate(&rep, rb_id, rb_desc, HeapType::Readback);
    let live_upload = recreate(&rep, upload_id, upload_desc, HeapType::Upload);
    let summary = rep.mgr.load_initial_states(&CaptureReader::from_bytes(bytes).unwrap()).unwrap();
    assert_eq!(summary.loaded, 3);
    assert_eq!(summary.failed, 0);

    let applied = rep.mgr.apply_all_initial_states().unwrap();
    assert_eq!(applied.applied, 3);
    assert_eq!(rep.device.buffer_contents(live_gpu).unwrap(), pattern(1024, 1));
    assert_eq!(rep.device.buffer_contents(live_rb).unwrap(), vec![7; 16]);
    assert_eq!(rep.device.buffer_contents(live_upload).unwrap(), pattern(100, 9));

    // a second replay loop restores again after the frame dirtied the buffer
    rep.mgr.set_state(CaptureState::ActiveReplaying);
    rep.device.fill_buffer(live_gpu, 0, &[0; 1024]).unwrap();
    rep.mgr.apply_all_initial_states().unwrap();
    assert_eq!(rep.device.buffer_contents(live_gpu).unwrap(), pattern(1024, 1));
}

#[test]
fn test_size_estimate_bounds_every_chunk() {
    let cap = side();
    let buffer_desc = ResourceDesc::buffer(4000);
    let buffer = cap.device.create_resource(&buffer_desc, HeapType::Default).unwrap();
    let buffer_id = cap.mgr.register_resource(buffer, buffer_desc, HeapType::Default);

    let tex_desc = ResourceDesc::texture_2d(33, 17, 2, 3, Format::Rgba16Float);
    let tex = cap.device.create_resource(&tex_desc, HeapType::Default).unwrap();
    let tex_id = cap.mgr.register_resource(tex, tex_desc, HeapType::Default);

    let heap = cap.device.create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 4).unwrap();
    let heap_id = cap.mgr.register_descriptor_heap(heap, DescriptorHeapKind::CbvSrvUav, 4);
    let srv = Descriptor::Srv { resource: tex_id, view: ViewDesc { format: Format::Rgba16Float, ..Default::default() } };
    cap.mgr.record_descriptor_writes(heap_id, 0, &[srv, srv]).unwrap();
    cap.mgr.set_descriptor_name(heap_id, 1, "albedo");

    assert_eq!(cap.mgr.prepare_all_initial_states(), 3);
    cap.mgr.flush_pending_commands().unwrap();
    for id in [buffer_id, tex_id, heap_id] {
        let estimate = cap.mgr.get_size_initial_state(id);
        let mut ser = WriteSerialiser::new(Vec::new());
        cap.mgr.serialise_initial_state(&mut ser, id).unwrap();
        assert!(ser.bytes_written() <= estimate, "{id}: {} > {}", ser.bytes_written(), estimate);
    }
}

#[test]
fn test_msaa_texture_round_trips_through_array_slices() {
    let cap = side();
    let desc = ResourceDesc::texture_2d(256, 256, 1, 1, Format::Rgba8Unorm).with_samples(4);
    let tex = cap.device.create_resource(&desc, HeapType::Default).unwrap();
    let samples = pattern(256 * 256 * 4 * 4, 3);
    cap.device.fill_subresource(tex, 0, &samples).unwrap();
    let id = cap.mgr.register_resource(tex, desc, HeapType::Default);

    assert!(cap.mgr.prepare_initial_state(id));
    let slices = cap.mgr.with_initial_contents(id, |c| c.msaa_array().map(|a| a.desc.depth_or_array_size));
    assert_eq!(slices, Some(Some(4)));
    let mut writer = CaptureWriter::new(Vec::new()).unwrap();
    cap.mgr.write_initial_states(&mut writer).unwrap();
    let bytes = writer.finish().unwrap();

    let rep = replay_side_with(EngineConfig::default());
    let live = recreate(&rep, id, desc, HeapType::Default);
    rep.mgr.load_initial_states(&CaptureReader::from_bytes(bytes).unwrap()).unwrap();
    rep.mgr.apply_all_initial_states().unwrap();
    assert_eq!(rep.device.subresource_contents(live, 0).unwrap(), samples);
}

#[test]
fn test_ten_thousand_page_buffer_compiles_to_two_binds() {
    let pages = 10_000u32;
    let heap_a = ResourceId::new(100);
    let mut table = PageTable::for_buffer(u64::from(pages) * PAGE_SIZE);
    table.map_buffer_pages(0, pages / 2, heap_a, 0);

    let binds = SparseBinds::from_page_table(&table);
    assert_eq!(binds.len(), 2);
    assert_eq!(binds.binds()[0].heap, heap_a);
    assert!(binds.binds()[1].heap.is_null());
    assert_eq!(binds.binds()[1].region_start.x, pages / 2);

    table.map_buffer_pages(pages / 2, pages / 2, heap_a, u64::from(pages / 2) * PAGE_SIZE);
    assert_eq!(SparseBinds::from_page_table(&table).len(), 1);
}

#[test]
fn test_older_versions_still_load() {
    for version in [0x5, 0xB] {
        let cap = side();
        let desc = ResourceDesc::texture_2d(16, 16, 1, 2, Format::R32Float);
        let tex = cap.device.create_resource(&desc, HeapType::Default).unwrap();
        cap.device.fill_subresource(tex, 0, &pattern(16 * 16 * 4, 5)).unwrap();
        cap.device.fill_subresource(tex, 1, &pattern(8 * 8 * 4, 6)).unwrap();
        let id = cap.mgr.register_resource(tex, desc, HeapType::Default);

        let heap = cap.device.create_descriptor_heap(DescriptorHeapKind::Sampler, 2).unwrap();
        let heap_id = cap.mgr.register_descriptor_heap(heap, DescriptorHeapKind::Sampler, 2);
        cap.mgr.set_descriptor_name(heap_id, 0, "linear");

        let bytes = capture(&cap, version);
        let reader = CaptureReader::from_bytes(bytes).unwrap();
        assert_eq!(reader.version(), version);

        let rep = replay_side_with(EngineConfig::default());
        let live = recreate(&rep, id, desc, HeapType::Default);
        let live_heap = rep.device.create_descriptor_heap(DescriptorHeapKind::Sampler, 2).unwrap();
        rep.mgr.register_live(
            heap_id,
            live_heap,
            ResourceDetails::DescriptorHeap(gpusnap::resource::DescriptorHeapInfo::new(DescriptorHeapKind::Sampler, 2)),
        );
        let summary = rep.mgr.load_initial_states(&reader).unwrap();
        assert_eq!(summary.loaded, 2, "version {version:#x}");
        rep.mgr.apply_all_initial_states().unwrap();
        assert_eq!(rep.device.subresource_contents(live, 0).unwrap(), pattern(16 * 16 * 4, 5));
        assert_eq!(rep.device.subresource_contents(live, 1).unwrap(), pattern(8 * 8 * 4, 6));
    }
}

#[test]
fn test_fatal_flag_makes_apply_a_no_op() {
    let cap = side();
    let desc = ResourceDesc::buffer(256);
    let buffer = cap.device.create_resource(&desc, HeapType::Default).unwrap();
    cap.device.fill_buffer(buffer, 0, &[1; 256]).unwrap();
    let id = cap.mgr.register_resource(buffer, desc, HeapType::Default);
    let bytes = capture(&cap, gpusnap::serialise::CURRENT_VERSION);

    let rep = replay_side_with(EngineConfig::default());
    let live = recreate(&rep, id, desc, HeapType::Default);
    rep.mgr.load_initial_states(&CaptureReader::from_bytes(bytes).unwrap()).unwrap();
    rep.mgr.report_fatal(ResultCode::DeviceLost, "lost during load");

    let summary = rep.mgr.apply_all_initial_states().unwrap();
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(rep.device.buffer_contents(live).unwrap(), vec![0; 256]);
    assert_eq!(rep.mgr.fatal_error(), Some(ResultCode::DeviceLost));
}

// ---------------------------------------------------------------------------
// Acceleration structures
// ---------------------------------------------------------------------------

fn as_buffer_desc() -> ResourceDesc {
    ResourceDesc::buffer(65536).with_flags(ResourceFlags { acceleration_structure: true, ..Default::default() })
}

fn triangle_inputs(vertex_address: u64) -> BuildInputs {
    BuildInputs {
        ty: AsType::BottomLevel,
        geometries: vec![GeometryDesc {
            flags: 0,
            kind: GeometryKind::Triangles(TrianglesDesc {
                vertex_count: 3,
                vertex_buffer: AddressAndStride { address: vertex_address, stride: 12 },
                ..Default::default()
            }),
        }],
        ..Default::default()
    }
}

#[test]
fn test_tlas_zeroes_instances_of_unapplied_blas() {
    let cap = side();
    let vb_desc = ResourceDesc::buffer(1024);
    let vb = cap.device.create_resource(&vb_desc, HeapType::Default).unwrap();
    cap.device.fill_buffer(vb, 0, &pattern(1024, 2)).unwrap();
    let vb_id = cap.mgr.register_resource(vb, vb_desc, HeapType::Default);

    let as_desc = as_buffer_desc();
    let as_buffer = cap.device.create_resource(&as_desc, HeapType::Default).unwrap();
    let as_id = cap.mgr.register_resource(as_buffer, as_desc, HeapType::Default);
    let as_base = cap.device.gpu_address(as_buffer);

    let mut blases = Vec::new();
    for i in 0..3u64 {
        let blas = cap.mgr.register_acceleration_structure(as_id, i * 4096, 4096, AsType::BottomLevel).unwrap();
        cap.mgr.record_as_build(blas, &triangle_inputs(cap.device.gpu_address(vb) + i * 36)).unwrap();
        blases.push(blas);
    }

    let instances: Vec<InstanceDesc> = (0..3u64)
        .map(|i| InstanceDesc { acceleration_structure: as_base + i * 4096, ..Default::default() })
        .collect();
    let inst_bytes: &[u8] = bytemuck::cast_slice(&instances);
    let inst_desc = ResourceDesc::buffer(inst_bytes.len() as u64);
    let inst = cap.device.create_resource(&inst_desc, HeapType::Upload).unwrap();
    cap.device.fill_buffer(inst, 0, inst_bytes).unwrap();
    let inst_id = cap.mgr.register_resource(inst, inst_desc, HeapType::Upload);

    let tlas = cap.mgr.register_acceleration_structure(as_id, 16384, 4096, AsType::TopLevel).unwrap();
    let tlas_inputs = BuildInputs {
        ty: AsType::TopLevel,
        num_instances: 3,
        instance_descs: cap.device.gpu_address(inst),
        ..Default::default()
    };
    cap.mgr.record_as_build(tlas, &tlas_inputs).unwrap();
    cap.mgr.tick();
    let bytes = capture(&cap, gpusnap::serialise::CURRENT_VERSION);

    let rep = replay_side_with(EngineConfig { rt_auditing: true, ..Default::default() });
    recreate(&rep, vb_id, vb_desc, HeapType::Default);
    recreate(&rep, inst_id, inst_desc, HeapType::Upload);
    let live_as = recreate(&rep, as_id, as_desc, HeapType::Default);
    rep.mgr.register_original_address(as_id, as_base, as_desc.width);
    for (i, blas) in blases.iter().enumerate() {
        rep.mgr
            .register_live_acceleration_structure(*blas, as_id, i as u64 * 4096, 4096, AsType::BottomLevel)
            .unwrap();
    }
    rep.mgr.register_live_acceleration_structure(tlas, as_id, 16384, 4096, AsType::TopLevel).unwrap();

    let summary = rep.mgr.load_initial_states(&CaptureReader::from_bytes(bytes).unwrap()).unwrap();
    assert_eq!(summary.failed, 0);
    // the third BLAS is never restored
    assert!(rep.mgr.take_initial_contents(blases[2]).is_some());

    rep.mgr.apply_all_initial_states().unwrap();
    let live_base = rep.device.gpu_address(live_as);
    assert_ne!(live_base, as_base);
    let built = rep.device.built_structure(live_base + 16384).unwrap();
    assert_eq!(built.ty, AsType::TopLevel);
    assert_eq!(built.instances, vec![live_base, live_base + 4096, 0]);
    assert_eq!(rep.device.built_structure(live_base).unwrap().ty, AsType::BottomLevel);

    // a later replay loop re-applies the BLASes before patching again
    rep.mgr.set_state(CaptureState::ActiveReplaying);
    rep.mgr.apply_all_initial_states().unwrap();
    let rebuilt = rep.device.built_structure(live_base + 16384).unwrap();
    assert_eq!(rebuilt.instances, vec![live_base, live_base + 4096, 0]);
}

#[test]
fn test_driver_mismatch_is_fatal() {
    let config = EngineConfig { driver_as_serialisation: true, ..Default::default() };
    let cap = side_with(config.clone());
    let vb_desc = ResourceDesc::buffer(256);
    let vb = cap.device.create_resource(&vb_desc, HeapType::Default).unwrap();
    cap.mgr.register_resource(vb, vb_desc, HeapType::Default);
    let as_desc = as_buffer_desc();
    let as_buffer = cap.device.create_resource(&as_desc, HeapType::Default).unwrap();
    let as_id = cap.mgr.register_resource(as_buffer, as_desc, HeapType::Default);
    let blas = cap.mgr.register_acceleration_structure(as_id, 0, 4096, AsType::BottomLevel).unwrap();
    cap.device
        .execute(vec![GpuCommand::BuildAccelerationStructure {
            dest: cap.device.gpu_address(as_buffer),
            inputs: triangle_inputs(cap.device.gpu_address(vb)),
            scratch: 0,
        }])
        .unwrap();
    let bytes = capture(&cap, gpusnap::serialise::CURRENT_VERSION);

    let rep = replay_side_with(config);
    rep.device.set_driver_id([0xAB; 32]);
    recreate(&rep, as_id, as_desc, HeapType::Default);
    rep.mgr.register_live_acceleration_structure(blas, as_id, 0, 4096, AsType::BottomLevel).unwrap();

    let err = rep.mgr.load_initial_states(&CaptureReader::from_bytes(bytes).unwrap()).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(rep.mgr.fatal_error(), Some(ResultCode::ApiHardwareUnsupported));
    let summary = rep.mgr.apply_all_initial_states().unwrap();
    assert_eq!(summary.applied, 0);
}

#[test]
fn test_build_data_spills_to_disk_and_reloads() {
    let s = side_with(EngineConfig { disk_cache_age_ms: 0, ..Default::default() });
    let vb_desc = ResourceDesc::buffer(1024);
    let vb = s.device.create_resource(&vb_desc, HeapType::Default).unwrap();
    s.device.fill_buffer(vb, 0, &pattern(1024, 4)).unwrap();
    s.mgr.register_resource(vb, vb_desc, HeapType::Default);
    let as_buffer = s.device.create_resource(&as_buffer_desc(), HeapType::Default).unwrap();
    let as_id = s.mgr.register_resource(as_buffer, as_buffer_desc(), HeapType::Default);
    let blas = s.mgr.register_acceleration_structure(as_id, 0, 4096, AsType::BottomLevel).unwrap();
    let data = s.mgr.record_as_build(blas, &triangle_inputs(s.device.gpu_address(vb))).unwrap();

    s.mgr.tick();
    s.mgr.rt().flush();
    assert_eq!(data.state(), gpusnap::accel::BuildState::DiskCached);
    assert_eq!(s.mgr.statistics().accel.disk_cached_count, 1);
    assert_eq!(data.read_bytes().unwrap(), pattern(36, 4));

    let resident = data.ensure_resident(s.mgr.allocator()).unwrap();
    assert!(resident.is_some());
    assert_eq!(data.state(), gpusnap::accel::BuildState::Complete);
}

#[test]
fn test_build_data_released_from_many_threads() {
    let s = side();
    let vb_desc = ResourceDesc::buffer(1024);
    let vb = s.device.create_resource(&vb_desc, HeapType::Default).unwrap();
    s.mgr.register_resource(vb, vb_desc, HeapType::Default);
    let as_buffer = s.device.create_resource(&as_buffer_desc(), HeapType::Default).unwrap();
    let as_id = s.mgr.register_resource(as_buffer, as_buffer_desc(), HeapType::Default);
    let blas = s.mgr.register_acceleration_structure(as_id, 0, 4096, AsType::BottomLevel).unwrap();
    let data = s.mgr.record_as_build(blas, &triangle_inputs(s.device.gpu_address(vb))).unwrap();
    s.mgr.tick();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let data = Arc::clone(&data);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let copy = Arc::clone(&data);
                    drop(copy);
                }
                drop(data);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    // the registry record and this handle remain
    assert_eq!(Arc::strong_count(&data), 2);

    s.mgr.release_resource(blas);
    assert_eq!(Arc::strong_count(&data), 1);
    drop(data);
    s.mgr.tick();
    assert_eq!(s.mgr.statistics().accel.in_memory_count, 0);
}
