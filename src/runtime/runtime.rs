/// The runtime context: lifecycle, memory surface and per-call dispatch.
use serde::Serialize;
use std::path::Path;

use crate::buffer::{BufferDesc, CopyKind, MemPtr, OpKind, PimBuffer, Residency};
use crate::bundle::BundleCache;
use crate::config::{AppConfig, RuntimeKind};
use crate::error::{PimError, PimResult};
use crate::executor::{BnOperands, Executor, Launch, SoftExecutor, StreamId};
use crate::layout::{GranuleOrder, LayoutConverter};
use crate::memdomain::{EmulatedBackend, MemoryBackend, MemoryManager};
use crate::runtime::policy::{
  check_gemv_list_feasible, select_path, Activation, Decision, FusedGemv, GemvOperands, KernelMode,
};
use crate::topology::Topology;
use crate::utils::trace::DispatchTrace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
  Uninitialized,
  Initialized,
  /// Terminal.
  Deinitialized,
}

/// Path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
  pub pim: u64,
  pub fallback: u64,
  pub bundles_built: u64,
}

/// One dispatchable operation over caller-owned buffers.
pub enum Operation<'a> {
  Add {
    out: &'a PimBuffer,
    a: &'a PimBuffer,
    b: &'a PimBuffer,
  },
  Mul {
    out: &'a PimBuffer,
    a: &'a PimBuffer,
    b: &'a PimBuffer,
  },
  Relu {
    out: &'a PimBuffer,
    input: &'a PimBuffer,
  },
  BatchNorm {
    out: &'a PimBuffer,
    input: &'a PimBuffer,
    params: BnOperands<'a>,
  },
  Gemv {
    out: &'a PimBuffer,
    vector: &'a PimBuffer,
    weight: &'a PimBuffer,
  },
  /// `out += weight x vector`
  GemvAdd {
    out: &'a PimBuffer,
    vector: &'a PimBuffer,
    weight: &'a PimBuffer,
  },
  /// `out = act(weight x vector + bias)`
  GemvBias {
    out: &'a PimBuffer,
    vector: &'a PimBuffer,
    weight: &'a PimBuffer,
    bias: &'a PimBuffer,
    activation: Activation,
  },
  /// One vector against a stack of weights `(list, 1, h, w)`.
  GemvList {
    out: &'a PimBuffer,
    vector: &'a PimBuffer,
    weights: &'a PimBuffer,
  },
}

impl Operation<'_> {
  pub fn kind(&self) -> OpKind {
    match self {
      Operation::Add { .. } => OpKind::Add,
      Operation::Mul { .. } => OpKind::Mul,
      Operation::Relu { .. } => OpKind::Relu,
      Operation::BatchNorm { .. } => OpKind::BatchNorm,
      Operation::Gemv { .. } => OpKind::Gemv,
      Operation::GemvAdd { .. } | Operation::GemvBias { .. } => OpKind::GemvAdd,
      Operation::GemvList { .. } => OpKind::GemvList,
    }
  }
}

type PathHook = Box<dyn FnMut(OpKind, &Decision)>;

pub struct Runtime {
  config: AppConfig,
  mode: KernelMode,
  state: RuntimeState,
  mem: MemoryManager,
  executor: Box<dyn Executor>,
  converter: LayoutConverter,
  bundles: BundleCache,
  stats: DispatchStats,
  hook: Option<PathHook>,
  trace: Option<DispatchTrace>,
}

impl Runtime {
  pub fn new(config: AppConfig, backend: Box<dyn MemoryBackend>, executor: Box<dyn Executor>) -> PimResult<Self> {
    crate::config::validate_config(&config)?;
    let section = &config.runtime;
    let topology = config.topology.clone();
    let arena = section.pim_arena_bytes;
    let alignment = (topology.row_bytes() as u64).min(arena as u64);
    let order = match section.kind {
      RuntimeKind::Hardware => GranuleOrder::Hardware,
      RuntimeKind::Simulator => GranuleOrder::Simulator,
    };

    log::info!(
      "runtime: {:?} kind, {:?} precision, {} mode, bundle keying {:?}",
      section.kind,
      section.precision,
      section.kernel_mode,
      section.bundle_keying
    );
    Ok(Self {
      mode: section.kernel_mode,
      mem: MemoryManager::new(backend, section.devices, arena, alignment),
      executor,
      converter: LayoutConverter::new(topology, order, section.repack_in_place),
      bundles: BundleCache::new(section.bundle_keying),
      stats: DispatchStats::default(),
      hook: None,
      trace: None,
      state: RuntimeState::Uninitialized,
      config,
    })
  }

  /// Runtime over emulated memory and the software executor.
  pub fn simulated(config: AppConfig) -> PimResult<Self> {
    Self::new(config, Box::new(EmulatedBackend::new()), Box::new(SoftExecutor::new()))
  }

  pub fn initialize(&mut self) -> PimResult<()> {
    match self.state {
      RuntimeState::Uninitialized => {},
      RuntimeState::Initialized => return Err(PimError::invalid("runtime is already initialized")),
      RuntimeState::Deinitialized => return Err(PimError::NotInitialized),
    }
    self.mem.initialize()?;
    self.executor.initialize()?;
    let trace_file = self.config.runtime.trace_file.trim();
    if !trace_file.is_empty() {
      self.trace = Some(DispatchTrace::create(Path::new(trace_file))?);
    }
    self.state = RuntimeState::Initialized;
    log::info!("runtime initialized");
    Ok(())
  }

  /// Release every bundle and backend resource. The runtime cannot be reused.
  pub fn deinitialize(&mut self) -> PimResult<()> {
    self.ensure_ready()?;
    self.state = RuntimeState::Deinitialized;
    let released = self.bundles.release_all(&mut self.mem);
    let stopped = self.executor.deinitialize();
    self.mem.deinitialize();
    self.trace = None;
    log::info!(
      "runtime deinitialized: {} pim / {} fallback dispatches",
      self.stats.pim,
      self.stats.fallback
    );
    released.and(stopped)
  }

  fn ensure_ready(&self) -> PimResult<()> {
    if self.state == RuntimeState::Initialized {
      Ok(())
    } else {
      Err(PimError::NotInitialized)
    }
  }

  pub fn state(&self) -> RuntimeState {
    self.state
  }

  pub fn mode(&self) -> KernelMode {
    self.mode
  }

  /// Applies to the next dispatch; cached bundles stay valid.
  pub fn set_mode(&mut self, mode: KernelMode) {
    log::info!("kernel mode: {} -> {}", self.mode, mode);
    self.mode = mode;
  }

  pub fn config(&self) -> &AppConfig {
    &self.config
  }

  pub fn topology(&self) -> &Topology {
    self.converter.topology()
  }

  pub fn stats(&self) -> DispatchStats {
    self.stats
  }

  pub fn bundles(&self) -> &BundleCache {
    &self.bundles
  }

  pub fn memory(&self) -> &MemoryManager {
    &self.mem
  }

  /// Called with every path decision, before the kernel is issued.
  pub fn set_path_hook<F>(&mut self, hook: F)
  where
    F: FnMut(OpKind, &Decision) + 'static,
  {
    self.hook = Some(Box::new(hook));
  }

  // memory surface

  pub fn set_device(&mut self, device: u32) -> PimResult<()> {
    self.ensure_ready()?;
    self.mem.set_device(device)
  }

  pub fn allocate(&mut self, desc: &BufferDesc) -> PimResult<PimBuffer> {
    self.ensure_ready()?;
    self.mem.allocate(desc)
  }

  /// Buffer over caller-owned memory. Freeing it never releases `ptr`.
  pub fn allocate_with_ptr(&mut self, desc: &BufferDesc, ptr: MemPtr) -> PimResult<PimBuffer> {
    self.ensure_ready()?;
    self.mem.allocate_with_ptr(desc, ptr)
  }

  pub fn alloc_raw(&mut self, size: usize, residency: Residency) -> PimResult<MemPtr> {
    self.ensure_ready()?;
    self.mem.alloc_raw(size, residency)
  }

  pub fn free_raw(&mut self, ptr: MemPtr) -> PimResult<()> {
    self.ensure_ready()?;
    self.mem.free_raw(ptr)
  }

  pub fn free(&mut self, buf: &mut PimBuffer) -> PimResult<()> {
    self.ensure_ready()?;
    self.mem.free(buf)
  }

  /// PIM to PIM copies run on the executor; every other direction is a memory move.
  pub fn copy(&mut self, dst: &PimBuffer, src: &PimBuffer, kind: CopyKind) -> PimResult<()> {
    self.ensure_ready()?;
    if kind != CopyKind::PimToPim {
      return self.mem.copy(dst, src, kind);
    }
    if src.residency() != Residency::Pim || dst.residency() != Residency::Pim {
      return Err(PimError::invalid("PimToPim copy between non-PIM buffers"));
    }
    if dst.ptr().is_none() || src.ptr().is_none() {
      return Err(PimError::invalid("copy with a null data handle"));
    }
    self
      .executor
      .execute_copy(&mut self.mem, dst, src, Launch::blocking(StreamId::default()))
  }

  pub fn write_f32s(&mut self, buf: &PimBuffer, values: &[f32]) -> PimResult<()> {
    self.ensure_ready()?;
    self.mem.write_f32s(buf, values)
  }

  pub fn read_f32s(&self, buf: &PimBuffer) -> PimResult<Vec<f32>> {
    self.ensure_ready()?;
    self.mem.read_f32s(buf)
  }

  pub fn write_bytes(&mut self, buf: &PimBuffer, data: &[u8]) -> PimResult<()> {
    self.ensure_ready()?;
    self.mem.write_bytes(buf, data)
  }

  pub fn read_bytes(&self, buf: &PimBuffer) -> PimResult<&[u8]> {
    self.ensure_ready()?;
    self.mem.read_bytes(buf)
  }

  pub fn convert_layout(&mut self, dst: &PimBuffer, src: &PimBuffer, src2: Option<&PimBuffer>, op: OpKind) -> PimResult<()> {
    self.ensure_ready()?;
    self.converter.convert_layout(&mut self.mem, dst, src, src2, op)
  }

  // dispatch

  pub fn execute(&mut self, op: Operation<'_>, stream: StreamId, block: bool) -> PimResult<()> {
    self.ensure_ready()?;
    let launch = Launch { stream, block };
    let kind = op.kind();
    match op {
      Operation::Add { out, a, b } => {
        self.record(kind, &elementwise(), launch);
        self.executor.execute_add(&mut self.mem, out, a, b, launch)
      },
      Operation::Mul { out, a, b } => {
        self.record(kind, &elementwise(), launch);
        self.executor.execute_mul(&mut self.mem, out, a, b, launch)
      },
      Operation::Relu { out, input } => {
        self.record(kind, &elementwise(), launch);
        self.executor.execute_relu(&mut self.mem, out, input, launch)
      },
      Operation::BatchNorm { out, input, params } => {
        self.record(kind, &elementwise(), launch);
        self.executor.execute_bn(&mut self.mem, out, input, params, launch)
      },
      Operation::Gemv { out, vector, weight } => self.dispatch_gemv(kind, out, vector, weight, false, launch),
      Operation::GemvAdd { out, vector, weight } => self.dispatch_gemv(kind, out, vector, weight, true, launch),
      Operation::GemvBias {
        out,
        vector,
        weight,
        bias,
        activation,
      } => {
        let fused = FusedGemv::new(weight.desc(), bias.desc(), activation)?;
        self.record(
          kind,
          &Decision::UseFallback {
            reason: "fused bias runs on the custom kernel".to_string(),
          },
          launch,
        );
        self.executor.execute_custom_gemv_add(
          &mut self.mem,
          out,
          vector,
          weight,
          bias,
          fused.activation == Activation::Relu,
          launch,
        )
      },
      Operation::GemvList { out, vector, weights } => self.dispatch_gemv_list(out, vector, weights, launch),
    }
  }

  /// Block until every command issued on `stream` has completed.
  pub fn execute_sync(&mut self, stream: StreamId) -> PimResult<()> {
    self.ensure_ready()?;
    self.executor.execute_sync(&mut self.mem, stream)
  }

  pub fn execute_dummy(&mut self) -> PimResult<()> {
    self.ensure_ready()?;
    self.executor.execute_dummy()
  }

  fn dispatch_gemv(
    &mut self,
    kind: OpKind,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    accumulate: bool,
    launch: Launch,
  ) -> PimResult<()> {
    let ops = GemvOperands {
      output: out.desc(),
      vector: vector.desc(),
      weight: weight.desc(),
    };
    let decision = select_path(self.mode, self.converter.topology(), &ops);
    self.record(kind, &decision, launch);

    if !decision.is_pim() {
      return self
        .executor
        .execute_custom_gemv(&mut self.mem, out, vector, weight, accumulate, launch);
    }

    let built = self.bundles.conversions();
    let bundle = self
      .bundles
      .get_or_build(&mut self.mem, &self.converter, weight, Some(vector), Some(out), 1)?;
    let (reordered, layout) = (bundle.reordered_weight().view(), bundle.layout().clone());
    if self.bundles.conversions() > built {
      self.stats.bundles_built += 1;
    }
    if accumulate {
      self
        .executor
        .execute_gemv_add(&mut self.mem, out, vector, &reordered, &layout, launch)
    } else {
      self
        .executor
        .execute_gemv(&mut self.mem, out, vector, &reordered, &layout, launch)
    }
  }

  fn dispatch_gemv_list(&mut self, out: &PimBuffer, vector: &PimBuffer, weights: &PimBuffer, launch: Launch) -> PimResult<()> {
    let ops = GemvOperands {
      output: out.desc(),
      vector: vector.desc(),
      weight: weights.desc(),
    };
    if let Err(why) = check_gemv_list_feasible(self.converter.topology(), &ops) {
      log::error!("gemv list rejected: {}", why);
      return Err(PimError::invalid(format!("gemv list rejected: {}", why)));
    }
    self.record(
      OpKind::GemvList,
      &Decision::UsePim {
        reason: "every matrix feasible".to_string(),
      },
      launch,
    );

    let list = weights.desc().requested().n;
    let built = self.bundles.conversions();
    let bundle = self
      .bundles
      .get_or_build(&mut self.mem, &self.converter, weights, Some(vector), Some(out), list)?;
    let (reordered, layout) = (bundle.reordered_weight().view(), bundle.layout().clone());
    if self.bundles.conversions() > built {
      self.stats.bundles_built += 1;
    }
    self
      .executor
      .execute_gemv_list(&mut self.mem, out, vector, &reordered, &layout, list, launch)
  }

  fn record(&mut self, kind: OpKind, decision: &Decision, launch: Launch) {
    if decision.is_pim() {
      self.stats.pim += 1;
    } else {
      self.stats.fallback += 1;
    }
    log::debug!("{}: {} path ({})", kind, decision.path(), decision.reason());
    if let Some(hook) = self.hook.as_mut() {
      hook(kind, decision);
    }
    self.trace(kind, decision, launch);
  }

  fn trace(&mut self, kind: OpKind, decision: &Decision, launch: Launch) {
    if let Some(trace) = self.trace.as_mut() {
      if let Err(e) = trace.record(kind, decision, launch) {
        log::warn!("dispatch trace write failed, disabling trace: {}", e);
        self.trace = None;
      }
    }
  }
}

fn elementwise() -> Decision {
  Decision::UsePim {
    reason: "element-wise ops run on the PIM executor".to_string(),
  }
}

impl Drop for Runtime {
  fn drop(&mut self) {
    if self.state == RuntimeState::Initialized {
      if let Err(e) = self.deinitialize() {
        log::error!("runtime teardown failed: {}", e);
      }
    }
  }
}
