// Executor: the collaborator that runs kernels on PIM hardware or in software

pub mod soft;

pub use soft::SoftExecutor;

use crate::buffer::PimBuffer;
use crate::error::PimResult;
use crate::layout::GemvLayout;
use crate::memdomain::MemoryManager;

/// Command stream handle. Commands on one stream run in issue order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "stream{}", self.0)
  }
}

/// Where and how a kernel is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
  pub stream: StreamId,
  /// Wait for completion before returning.
  pub block: bool,
}

impl Launch {
  pub fn blocking(stream: StreamId) -> Self {
    Self { stream, block: true }
  }

  pub fn deferred(stream: StreamId) -> Self {
    Self { stream, block: false }
  }
}

/// Compiled kernel tag carried by every issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
  Add,
  Mul,
  Relu,
  BatchNorm,
  PimGemv,
  PimGemvAdd,
  PimGemvList,
  CustomGemv,
  CustomGemvAdd,
  CustomGemvBias,
  Copy,
}

/// Per-channel batch normalization parameters, each a vector of `c` elements.
#[derive(Debug, Clone, Copy)]
pub struct BnOperands<'a> {
  pub beta: &'a PimBuffer,
  pub gamma: &'a PimBuffer,
  pub mean: &'a PimBuffer,
  pub variance: &'a PimBuffer,
  pub epsilon: f64,
}

/// Kernel execution backend.
///
/// Operand storage is reached through the memory manager passed to every call. With
/// `launch.block == false` a command may only be queued; its results are visible after
/// `execute_sync` on the same stream.
pub trait Executor {
  fn initialize(&mut self) -> PimResult<()>;

  fn deinitialize(&mut self) -> PimResult<()>;

  fn execute_add(&mut self, mem: &mut MemoryManager, out: &PimBuffer, a: &PimBuffer, b: &PimBuffer, launch: Launch) -> PimResult<()>;

  fn execute_mul(&mut self, mem: &mut MemoryManager, out: &PimBuffer, a: &PimBuffer, b: &PimBuffer, launch: Launch) -> PimResult<()>;

  fn execute_relu(&mut self, mem: &mut MemoryManager, out: &PimBuffer, input: &PimBuffer, launch: Launch) -> PimResult<()>;

  fn execute_bn(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    input: &PimBuffer,
    params: BnOperands<'_>,
    launch: Launch,
  ) -> PimResult<()>;

  /// PIM GEMV over a bank-interleaved weight.
  fn execute_gemv(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    layout: &GemvLayout,
    launch: Launch,
  ) -> PimResult<()>;

  /// PIM GEMV accumulating into `out`.
  fn execute_gemv_add(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    layout: &GemvLayout,
    launch: Launch,
  ) -> PimResult<()>;

  /// PIM GEMV of one vector against a stack of `list` weights.
  #[allow(clippy::too_many_arguments)]
  fn execute_gemv_list(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    layout: &GemvLayout,
    list: usize,
    launch: Launch,
  ) -> PimResult<()>;

  /// Fallback GEMV on the row-major weight. Handles transposed weights.
  fn execute_custom_gemv(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    accumulate: bool,
    launch: Launch,
  ) -> PimResult<()>;

  /// Fallback fused GEMV + bias, optionally followed by relu.
  #[allow(clippy::too_many_arguments)]
  fn execute_custom_gemv_add(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    bias: &PimBuffer,
    relu: bool,
    launch: Launch,
  ) -> PimResult<()>;

  /// PIM to PIM copy; a compute operation on the device.
  fn execute_copy(&mut self, mem: &mut MemoryManager, dst: &PimBuffer, src: &PimBuffer, launch: Launch) -> PimResult<()>;

  /// Block until every command issued on `stream` has completed.
  fn execute_sync(&mut self, mem: &mut MemoryManager, stream: StreamId) -> PimResult<()>;

  /// No-op launch that primes the executor.
  fn execute_dummy(&mut self) -> PimResult<()>;
}
