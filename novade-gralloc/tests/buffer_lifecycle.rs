use novade_gralloc::config::DeviceConfig;
use novade_gralloc::native::NativeBo;
use novade_gralloc::ownership::resolve;
use novade_gralloc::{
    BackendKind, BufferHandle, GrallocConfig, GrallocError, GrallocModule, LockError, PixelFormat, Rect, UsageFlags,
};
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

fn open_module(node: &NamedTempFile) -> GrallocModule {
    let config = GrallocConfig {
        device: DeviceConfig {
            path: Some(node.path().display().to_string()),
            backend: BackendKind::Memfd,
        },
        ..GrallocConfig::default()
    };
    GrallocModule::open(&config).unwrap()
}

#[test]
fn test_render_target_read_back() {
    let node = NamedTempFile::new().unwrap();
    let module = open_module(&node);

    let mut handle = module
        .alloc(1920, 1080, PixelFormat::Rgba8888, UsageFlags::HW_RENDER | UsageFlags::SW_READ_OFTEN)
        .unwrap();
    assert_eq!(handle.stride(), 1920 * 4);

    let addr = module
        .lock(&handle, UsageFlags::SW_READ_OFTEN, Rect::new(0, 0, 1920, 1080))
        .unwrap();
    assert!(addr.is_some());
    module.unlock(&handle).unwrap();

    module.unregister(&mut handle).unwrap();
    assert!(resolve(&mut handle, None).is_none());
    handle.close_fd();
}

#[test]
fn test_render_only_buffer_refuses_cpu_read() {
    let node = NamedTempFile::new().unwrap();
    let module = open_module(&node);

    let handle = module.alloc(1920, 1080, PixelFormat::Rgba8888, UsageFlags::HW_RENDER).unwrap();
    let err = module
        .lock(&handle, UsageFlags::SW_READ_OFTEN, Rect::new(0, 0, 1920, 1080))
        .unwrap_err();
    assert!(matches!(err, GrallocError::Lock(LockError::IncompatibleUsage { .. })));
    assert_eq!(err.errno(), -libc::EINVAL);
    module.free(handle).unwrap();
}

#[test]
fn test_shared_handle_sees_producer_pixels() {
    let node = NamedTempFile::new().unwrap();
    let module = open_module(&node);
    let usage = UsageFlags::SW_READ_OFTEN | UsageFlags::SW_WRITE_OFTEN | UsageFlags::HW_TEXTURE;

    let producer = module.alloc(64, 32, PixelFormat::Bgra8888, usage).unwrap();
    let addr = module
        .lock(&producer, UsageFlags::SW_WRITE_OFTEN, Rect::new(0, 0, 64, 32))
        .unwrap()
        .unwrap();
    // SAFETY: the mapping covers at least one row.
    unsafe { addr.as_ptr().write_bytes(0xab, 16) };
    module.unlock(&producer).unwrap();

    // What the transport hands to the consumer: the bytes plus a duplicated descriptor.
    let fd = producer.fd().map(|fd| fd.try_clone_to_owned().unwrap());
    let mut consumer = BufferHandle::decode(&producer.encode(), fd).unwrap();
    assert!(resolve(&mut consumer, None).is_none());
    module.register(&mut consumer).unwrap();
    assert_eq!(module.native_bo(&consumer, |bo| bo.stride()), Some(producer.stride()));

    let addr = module
        .lock(&consumer, UsageFlags::SW_READ_OFTEN, Rect::new(0, 0, 64, 32))
        .unwrap()
        .unwrap();
    // SAFETY: same as above.
    let first_row = unsafe { std::slice::from_raw_parts(addr.as_ptr(), 16) };
    assert!(first_row.iter().all(|&b| b == 0xab));
    module.unlock(&consumer).unwrap();

    module.unregister(&mut consumer).unwrap();
    module.free(producer).unwrap();
}

#[test]
fn test_foreign_owner_takes_import_path() {
    let node = NamedTempFile::new().unwrap();
    let module = open_module(&node);
    let mut handle = module.alloc(32, 32, PixelFormat::Rgbx8888, UsageFlags::HW_TEXTURE).unwrap();

    let mut wire = handle.to_wire();
    wire.owner_pid = wire.owner_pid.wrapping_add(1);
    let fd = handle.fd().map(|fd| fd.try_clone_to_owned().unwrap());
    let mut foreign = BufferHandle::from_wire(wire, fd);
    assert!(resolve(&mut foreign, None).is_none());
    assert!(resolve(&mut foreign, Some(module.device())).is_some());
    assert_eq!(foreign.owner_pid(), std::process::id());

    module.unregister(&mut foreign).unwrap();
    module.unregister(&mut handle).unwrap();
    handle.close_fd();
}

#[test]
fn test_allocation_geometry() {
    let node = NamedTempFile::new().unwrap();
    let module = open_module(&node);
    let extent = |bo: &dyn NativeBo| (bo.width(), bo.height());

    let rarely = module.alloc(32, 32, PixelFormat::Rgba8888, UsageFlags::SW_READ_RARELY | UsageFlags::HW_RENDER).unwrap();
    let addr = module
        .lock(&rarely, UsageFlags::SW_WRITE_RARELY, Rect::new(0, 0, 32, 32))
        .unwrap();
    assert!(addr.is_some(), "A software-read buffer may be locked for any usage.");
    module.unlock(&rarely).unwrap();
    module.free(rarely).unwrap();

    let planar = module.alloc(64, 64, PixelFormat::Yv12, UsageFlags::SW_READ_OFTEN).unwrap();
    assert_eq!(module.native_bo(&planar, extent), Some((32, 96)));
    module.free(planar).unwrap();

    let cursor = module.alloc(16, 16, PixelFormat::Rgba8888, UsageFlags::CURSOR).unwrap();
    let (width, height) = module.native_bo(&cursor, extent).unwrap();
    assert!(width >= 64 && height >= 64, "cursor allocated as {width}x{height}");
    module.free(cursor).unwrap();
}

#[test]
fn test_unsupported_format_code() {
    let node = NamedTempFile::new().unwrap();
    let module = open_module(&node);
    let handle = module.alloc(8, 8, PixelFormat::Rgba8888, UsageFlags::HW_RENDER).unwrap();

    let mut wire = handle.to_wire();
    wire.format = 0x7fff;
    let mut bogus = BufferHandle::from_wire(wire, handle.fd().map(|fd| fd.try_clone_to_owned().unwrap()));
    assert!(module.register(&mut bogus).is_err());
    module.free(handle).unwrap();
}
