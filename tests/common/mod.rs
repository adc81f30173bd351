#![allow(dead_code)]

use pimrt::config::AppConfig;
use pimrt::utils::log::init_log;
use pimrt::{BufferDesc, KernelMode, PimBuffer, Precision, Residency, Runtime, Shape4, Topology};
use std::sync::{Mutex, MutexGuard};

// Tests in one binary share the emulated arenas' memory budget; run them one at a time
static TEST_MUTEX: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
  let guard = TEST_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  init_log();
  guard
}

/// 2 channels x 4 banks; input tile 4 fp16 values, output tile 8 rows.
pub fn small_topology() -> Topology {
  Topology {
    grf_rows_a: 2,
    grf_rows_b: 2,
    blocks_per_group: 2,
    channels: 2,
    ranks: 1,
    banks: 4,
    bank_groups: 2,
    transfer_granularity: 4,
    cols_per_row: 8,
    rows: 16,
  }
}

pub fn small_config(mode: KernelMode) -> AppConfig {
  let mut config = AppConfig::default();
  config.topology = small_topology();
  config.runtime.kernel_mode = mode;
  config.runtime.pim_arena_bytes = 1 << 16;
  config
}

pub fn runtime(config: AppConfig) -> Runtime {
  let mut rt = Runtime::simulated(config).unwrap();
  rt.initialize().unwrap();
  rt
}

pub fn device_buffer(rt: &mut Runtime, shape: Shape4, values: &[f32]) -> PimBuffer {
  let buf = rt
    .allocate(&BufferDesc::new(shape, Precision::Fp16, Residency::Device))
    .unwrap();
  rt.write_f32s(&buf, values).unwrap();
  buf
}

pub fn weight(rt: &mut Runtime, rows: usize, cols: usize, values: &[f32]) -> PimBuffer {
  device_buffer(rt, Shape4::new(1, 1, rows, cols), values)
}
