//! Hardware tests
//!
//! Need a DPU bound to vfio-pci (or exposing sysfs BARs) at the address in
//! `DPU_PCIE_ADDRESS`.

use dpu_driver::backends::{MappedPlatform, VfioPlatform};
use dpu_driver::{BackendSelection, Controller, ControllerConfig, Platform, ProgramImage, TensorShape, WorkerPool};
use std::time::Duration;

fn pcie_address() -> String {
    std::env::var("DPU_PCIE_ADDRESS").unwrap_or_else(|_| "0000:01:00.0".to_string())
}

#[test]
#[ignore] // Requires hardware
fn vfio_platform_reads_version_code() {
    let platform = VfioPlatform::open(&pcie_address()).expect("Failed to open VFIO platform");
    let pool = WorkerPool::new(&platform, 1).expect("worker pool");
    let version = pool.execute(|engine| engine.read_fingerprint()).expect("fingerprint");
    assert_ne!(version, 0, "version code reads as zero");
    assert_ne!(version, u64::MAX, "device not responding");
}

#[test]
#[ignore] // Requires hardware
fn mapped_and_vfio_buffers_round_trip() {
    let address = pcie_address();
    let platforms: Vec<Box<dyn Platform>> = vec![
        Box::new(VfioPlatform::open(&address).expect("vfio")),
        Box::new(MappedPlatform::open(&address).expect("mapped")),
    ];
    for platform in &platforms {
        let mut buffer = dpu_driver::DeviceBuffer::allocate_bytes(platform.as_ref(), 4096, dpu_driver::BufferRole::Swap)
            .expect("allocate");
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        buffer.write(&data).expect("write");
        assert_eq!(buffer.read().expect("read"), data.as_slice(), "{}", platform.backend_type());
    }
}

#[test]
#[ignore] // Requires hardware and a compiled program in DPU_PROGRAM_DIR
fn controller_runs_compiled_program() {
    let dir = std::path::PathBuf::from(std::env::var("DPU_PROGRAM_DIR").expect("DPU_PROGRAM_DIR"));
    let program = ProgramImage::new(
        std::fs::read(dir.join("instr.bin")).expect("instructions"),
        std::fs::read(dir.join("params.bin")).expect("params"),
    );
    let config = ControllerConfig::new(TensorShape::int8(4, 8, 8, 16), 8 * 8 * 16)
        .with_backend(BackendSelection::Auto, pcie_address())
        .with_golden(dir.join("golden.bin"))
        .with_wait(15, Duration::from_secs(1))
        .with_env_overrides();
    let controller = Controller::open(config, &program).expect("controller");
    let input = std::fs::read(dir.join("input.bin")).expect("input");
    let out = controller.run(&input).expect("run");
    let report = out.report.expect("golden report");
    assert!(report.passed(), "{}", report.render());
}
