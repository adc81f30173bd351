mod common;

use common::{device_buffer, runtime, serial, small_config};
use pimrt::runtime::{Operation, RuntimeState};
use pimrt::{BufferDesc, CopyKind, KernelMode, MemPtr, PimError, Precision, Residency, Runtime, Shape4, StreamId};

fn vector_desc(len: usize, residency: Residency) -> BufferDesc {
  BufferDesc::new(Shape4::vector(len), Precision::Fp16, residency)
}

#[test]
fn test_calls_outside_the_initialized_window_fail() {
  let _guard = serial();
  let mut rt = Runtime::simulated(small_config(KernelMode::Optimal)).unwrap();
  assert_eq!(rt.state(), RuntimeState::Uninitialized);
  assert!(matches!(rt.allocate(&vector_desc(4, Residency::Host)), Err(PimError::NotInitialized)));
  assert!(matches!(rt.execute_sync(StreamId(0)), Err(PimError::NotInitialized)));

  rt.initialize().unwrap();
  assert!(matches!(rt.initialize(), Err(PimError::InvalidConfiguration(_))));
  rt.execute_dummy().unwrap();

  rt.deinitialize().unwrap();
  assert_eq!(rt.state(), RuntimeState::Deinitialized);
  assert!(matches!(rt.allocate(&vector_desc(4, Residency::Host)), Err(PimError::NotInitialized)));
  assert!(matches!(rt.initialize(), Err(PimError::NotInitialized)));
  assert!(matches!(rt.deinitialize(), Err(PimError::NotInitialized)));
}

#[test]
fn test_invalid_topology_is_rejected_at_construction() {
  let _guard = serial();
  let mut config = small_config(KernelMode::Optimal);
  config.topology.bank_groups = 3;
  assert!(matches!(Runtime::simulated(config), Err(PimError::InvalidConfiguration(_))));
}

#[test]
fn test_borrowed_buffer_free_leaves_memory_alone() {
  let _guard = serial();
  let mut rt = runtime(small_config(KernelMode::Optimal));
  let desc = vector_desc(4, Residency::Device);
  let ptr = rt.alloc_raw(desc.size_bytes(), Residency::Device).unwrap();

  let mut user = rt.allocate_with_ptr(&desc, ptr).unwrap();
  assert!(user.is_external());
  rt.write_f32s(&user, &[1.0, 2.0, 3.0, 4.0]).unwrap();
  rt.free(&mut user).unwrap();

  let again = rt.allocate_with_ptr(&desc, ptr).unwrap();
  assert_eq!(rt.read_f32s(&again).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
  rt.free_raw(ptr).unwrap();
}

#[test]
fn test_owned_buffer_double_free_is_rejected() {
  let _guard = serial();
  let mut rt = runtime(small_config(KernelMode::Optimal));
  let mut buf = rt.allocate(&vector_desc(8, Residency::Pim)).unwrap();
  let live = rt.memory().heap(0).unwrap().live_bytes();
  assert!(live >= buf.size_bytes() as u64);
  rt.free(&mut buf).unwrap();
  assert_eq!(rt.memory().heap(0).unwrap().live_bytes(), 0);
  assert!(rt.free(&mut buf).is_err());
}

#[test]
fn test_copies_between_residencies() {
  let _guard = serial();
  let mut rt = runtime(small_config(KernelMode::Optimal));
  let host = device_buffer(&mut rt, Shape4::vector(4), &[0.0; 4]);
  rt.write_f32s(&host, &[1.5, -2.0, 0.25, 8.0]).unwrap();
  let pim_a = rt.allocate(&vector_desc(4, Residency::Pim)).unwrap();
  let pim_b = rt.allocate(&vector_desc(4, Residency::Pim)).unwrap();

  rt.copy(&pim_a, &host, CopyKind::DeviceToPim).unwrap();
  rt.copy(&pim_b, &pim_a, CopyKind::PimToPim).unwrap();
  assert_eq!(rt.read_f32s(&pim_b).unwrap(), vec![1.5, -2.0, 0.25, 8.0]);

  let host_only = rt.allocate(&vector_desc(4, Residency::Host)).unwrap();
  assert!(rt.copy(&pim_b, &host_only, CopyKind::PimToPim).is_err());
}

#[test]
fn test_deferred_dispatch_completes_at_sync() {
  let _guard = serial();
  let mut rt = runtime(small_config(KernelMode::Optimal));
  let a = device_buffer(&mut rt, Shape4::vector(4), &[1.0, 2.0, 3.0, 4.0]);
  let b = device_buffer(&mut rt, Shape4::vector(4), &[4.0, 3.0, 2.0, 1.0]);
  let out = device_buffer(&mut rt, Shape4::vector(4), &[0.0; 4]);
  let stream = StreamId(1);

  rt.execute(Operation::Mul { out: &out, a: &a, b: &b }, stream, false)
    .unwrap();
  assert_eq!(rt.read_f32s(&out).unwrap(), vec![0.0; 4]);
  rt.execute_sync(stream).unwrap();
  assert_eq!(rt.read_f32s(&out).unwrap(), vec![4.0, 6.0, 6.0, 4.0]);
}

#[test]
fn test_devices_have_separate_heaps() {
  let _guard = serial();
  let mut config = small_config(KernelMode::Optimal);
  config.runtime.devices = 2;
  let mut rt = runtime(config);
  assert!(matches!(rt.set_device(2), Err(PimError::InvalidConfiguration(_))));

  rt.set_device(1).unwrap();
  let ptr = rt.alloc_raw(256, Residency::Pim).unwrap();
  assert_eq!(ptr.device, 1);
  assert_eq!(rt.memory().heap(0).unwrap().live_bytes(), 0);
  assert!(rt.memory().heap(1).unwrap().live_bytes() >= 256);
  rt.free_raw(ptr).unwrap();
}

#[test]
fn test_dispatch_trace_records_each_decision() {
  let _guard = serial();
  let path = std::env::temp_dir().join(format!("pimrt-runtime-trace-{}.jsonl", std::process::id()));
  let mut config = small_config(KernelMode::ForceCustom);
  config.runtime.trace_file = path.to_string_lossy().to_string();
  let mut rt = runtime(config);

  let w = device_buffer(&mut rt, Shape4::new(1, 1, 8, 8), &[1.0; 64]);
  let x = device_buffer(&mut rt, Shape4::vector(8), &[1.0; 8]);
  let y = device_buffer(&mut rt, Shape4::vector(8), &[0.0; 8]);
  rt.execute(Operation::Gemv { out: &y, vector: &x, weight: &w }, StreamId(2), false)
    .unwrap();
  rt.execute(Operation::Relu { out: &y, input: &y }, StreamId(2), true)
    .unwrap();
  rt.deinitialize().unwrap();

  let text = std::fs::read_to_string(&path).unwrap();
  let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
  assert_eq!(lines.len(), 2);
  assert_eq!(lines[0]["op"], "gemv");
  assert_eq!(lines[0]["path"], "fallback");
  assert_eq!(lines[0]["block"], false);
  assert_eq!(lines[1]["op"], "relu");
  assert_eq!(lines[1]["seq"], 1);
  std::fs::remove_file(&path).ok();
}

#[test]
fn test_unsatisfiable_requests_return_errors() {
  let _guard = serial();
  let mut rt = runtime(small_config(KernelMode::Optimal));
  for residency in [Residency::Pim, Residency::Host, Residency::Device] {
    assert!(matches!(rt.alloc_raw(usize::MAX, residency), Err(PimError::AllocationFailure(_))));
  }
  let far = MemPtr {
    residency: Residency::Pim,
    device: 0,
    addr: u64::MAX,
  };
  assert!(matches!(
    rt.allocate_with_ptr(&vector_desc(4, Residency::Pim), far),
    Err(PimError::InvalidConfiguration(_))
  ));
  // the runtime is still usable afterwards
  let buf = device_buffer(&mut rt, Shape4::vector(4), &[1.0; 4]);
  assert_eq!(rt.read_f32s(&buf).unwrap(), vec![1.0; 4]);
}
