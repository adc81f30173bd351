/// Software executor: runs every kernel on the host against the emulated memory domains.
use std::collections::{HashMap, VecDeque};

use super::{BnOperands, Executor, KernelKind, Launch, StreamId};
use crate::buffer::PimBuffer;
use crate::error::{PimError, PimResult};
use crate::layout::GemvLayout;
use crate::memdomain::MemoryManager;

#[derive(Debug)]
enum Command {
  Add {
    out: PimBuffer,
    a: PimBuffer,
    b: PimBuffer,
  },
  Mul {
    out: PimBuffer,
    a: PimBuffer,
    b: PimBuffer,
  },
  Relu {
    out: PimBuffer,
    input: PimBuffer,
  },
  BatchNorm {
    out: PimBuffer,
    input: PimBuffer,
    beta: PimBuffer,
    gamma: PimBuffer,
    mean: PimBuffer,
    variance: PimBuffer,
    epsilon: f64,
  },
  PimGemv {
    out: PimBuffer,
    vector: PimBuffer,
    weight: PimBuffer,
    layout: GemvLayout,
    list: usize,
    accumulate: bool,
  },
  CustomGemv {
    out: PimBuffer,
    vector: PimBuffer,
    weight: PimBuffer,
    bias: Option<PimBuffer>,
    accumulate: bool,
    relu: bool,
  },
  Copy {
    dst: PimBuffer,
    src: PimBuffer,
  },
}

/// Executor backed by host arithmetic.
///
/// Deferred commands wait in a per-stream queue until the stream is synchronized or a
/// blocking command is issued on it.
#[derive(Debug, Default)]
pub struct SoftExecutor {
  streams: HashMap<StreamId, VecDeque<(KernelKind, Command)>>,
  launched: u64,
  dummy_calls: u64,
  initialized: bool,
}

impl SoftExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Kernels that have run to completion.
  pub fn launched(&self) -> u64 {
    self.launched
  }

  pub fn dummy_calls(&self) -> u64 {
    self.dummy_calls
  }

  /// Commands still queued on `stream`.
  pub fn pending(&self, stream: StreamId) -> usize {
    self.streams.get(&stream).map_or(0, VecDeque::len)
  }

  fn submit(&mut self, mem: &mut MemoryManager, kind: KernelKind, cmd: Command, launch: Launch) -> PimResult<()> {
    if !self.initialized {
      return Err(PimError::NotInitialized);
    }
    if launch.block {
      self.drain(mem, launch.stream)?;
      self.run(mem, kind, cmd)
    } else {
      log::debug!("{}: queued {:?}", launch.stream, kind);
      self.streams.entry(launch.stream).or_default().push_back((kind, cmd));
      Ok(())
    }
  }

  fn drain(&mut self, mem: &mut MemoryManager, stream: StreamId) -> PimResult<()> {
    let Some(mut queue) = self.streams.remove(&stream) else {
      return Ok(());
    };
    // a failed command is consumed; the ones behind it stay queued for the next sync
    while let Some((kind, cmd)) = queue.pop_front() {
      if let Err(e) = self.run(mem, kind, cmd) {
        if !queue.is_empty() {
          log::warn!("{}: {:?} failed, {} command(s) left queued", stream, kind, queue.len());
          self.streams.insert(stream, queue);
        }
        return Err(e);
      }
    }
    Ok(())
  }

  fn run(&mut self, mem: &mut MemoryManager, kind: KernelKind, cmd: Command) -> PimResult<()> {
    log::trace!("run {:?}", kind);
    match cmd {
      Command::Add { out, a, b } => binary(mem, &out, &a, &b, |x, y| x + y)?,
      Command::Mul { out, a, b } => binary(mem, &out, &a, &b, |x, y| x * y)?,
      Command::Relu { out, input } => {
        let values: Vec<f32> = mem.read_f32s(&input)?.into_iter().map(|v| v.max(0.0)).collect();
        mem.write_f32s(&out, &values)?;
      },
      Command::BatchNorm {
        out,
        input,
        beta,
        gamma,
        mean,
        variance,
        epsilon,
      } => batch_norm(mem, &out, &input, [&beta, &gamma, &mean, &variance], epsilon)?,
      Command::PimGemv {
        out,
        vector,
        weight,
        layout,
        list,
        accumulate,
      } => pim_gemv(mem, &out, &vector, &weight, &layout, list, accumulate)?,
      Command::CustomGemv {
        out,
        vector,
        weight,
        bias,
        accumulate,
        relu,
      } => custom_gemv(mem, &out, &vector, &weight, bias.as_ref(), accumulate, relu)?,
      Command::Copy { dst, src } => {
        let data = mem.read_bytes(&src)?[..dst.size_bytes()].to_vec();
        mem.write_bytes(&dst, &data)?;
      },
    }
    self.launched += 1;
    Ok(())
  }
}

impl Executor for SoftExecutor {
  fn initialize(&mut self) -> PimResult<()> {
    self.initialized = true;
    log::info!("software executor ready");
    Ok(())
  }

  fn deinitialize(&mut self) -> PimResult<()> {
    let dropped: usize = self.streams.values().map(VecDeque::len).sum();
    if dropped > 0 {
      log::warn!("software executor: dropping {} unsynchronized command(s)", dropped);
    }
    self.streams.clear();
    self.initialized = false;
    Ok(())
  }

  fn execute_add(&mut self, mem: &mut MemoryManager, out: &PimBuffer, a: &PimBuffer, b: &PimBuffer, launch: Launch) -> PimResult<()> {
    check_elementwise(out, &[a, b])?;
    let cmd = Command::Add {
      out: out.view(),
      a: a.view(),
      b: b.view(),
    };
    self.submit(mem, KernelKind::Add, cmd, launch)
  }

  fn execute_mul(&mut self, mem: &mut MemoryManager, out: &PimBuffer, a: &PimBuffer, b: &PimBuffer, launch: Launch) -> PimResult<()> {
    check_elementwise(out, &[a, b])?;
    let cmd = Command::Mul {
      out: out.view(),
      a: a.view(),
      b: b.view(),
    };
    self.submit(mem, KernelKind::Mul, cmd, launch)
  }

  fn execute_relu(&mut self, mem: &mut MemoryManager, out: &PimBuffer, input: &PimBuffer, launch: Launch) -> PimResult<()> {
    check_elementwise(out, &[input])?;
    let cmd = Command::Relu {
      out: out.view(),
      input: input.view(),
    };
    self.submit(mem, KernelKind::Relu, cmd, launch)
  }

  fn execute_bn(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    input: &PimBuffer,
    params: BnOperands<'_>,
    launch: Launch,
  ) -> PimResult<()> {
    check_elementwise(out, &[input])?;
    let channels = input.desc().real().c;
    for p in [params.beta, params.gamma, params.mean, params.variance] {
      if p.desc().real().len() < channels {
        return Err(PimError::invalid(format!(
          "batch norm parameter holds {} values for {} channels",
          p.desc().real().len(),
          channels
        )));
      }
    }
    let cmd = Command::BatchNorm {
      out: out.view(),
      input: input.view(),
      beta: params.beta.view(),
      gamma: params.gamma.view(),
      mean: params.mean.view(),
      variance: params.variance.view(),
      epsilon: params.epsilon,
    };
    self.submit(mem, KernelKind::BatchNorm, cmd, launch)
  }

  fn execute_gemv(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    layout: &GemvLayout,
    launch: Launch,
  ) -> PimResult<()> {
    self.issue_pim_gemv(mem, KernelKind::PimGemv, [out, vector, weight], layout, 1, false, launch)
  }

  fn execute_gemv_add(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    layout: &GemvLayout,
    launch: Launch,
  ) -> PimResult<()> {
    self.issue_pim_gemv(mem, KernelKind::PimGemvAdd, [out, vector, weight], layout, 1, true, launch)
  }

  fn execute_gemv_list(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    layout: &GemvLayout,
    list: usize,
    launch: Launch,
  ) -> PimResult<()> {
    self.issue_pim_gemv(mem, KernelKind::PimGemvList, [out, vector, weight], layout, list, false, launch)
  }

  fn execute_custom_gemv(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    accumulate: bool,
    launch: Launch,
  ) -> PimResult<()> {
    check_custom_gemv(out, vector, weight, None)?;
    let cmd = Command::CustomGemv {
      out: out.view(),
      vector: vector.view(),
      weight: weight.view(),
      bias: None,
      accumulate,
      relu: false,
    };
    let kind = if accumulate {
      KernelKind::CustomGemvAdd
    } else {
      KernelKind::CustomGemv
    };
    self.submit(mem, kind, cmd, launch)
  }

  fn execute_custom_gemv_add(
    &mut self,
    mem: &mut MemoryManager,
    out: &PimBuffer,
    vector: &PimBuffer,
    weight: &PimBuffer,
    bias: &PimBuffer,
    relu: bool,
    launch: Launch,
  ) -> PimResult<()> {
    check_custom_gemv(out, vector, weight, Some(bias))?;
    let cmd = Command::CustomGemv {
      out: out.view(),
      vector: vector.view(),
      weight: weight.view(),
      bias: Some(bias.view()),
      accumulate: false,
      relu,
    };
    self.submit(mem, KernelKind::CustomGemvBias, cmd, launch)
  }

  fn execute_copy(&mut self, mem: &mut MemoryManager, dst: &PimBuffer, src: &PimBuffer, launch: Launch) -> PimResult<()> {
    if src.size_bytes() < dst.size_bytes() {
      return Err(PimError::invalid(format!(
        "copy source holds {} bytes, destination needs {}",
        src.size_bytes(),
        dst.size_bytes()
      )));
    }
    let cmd = Command::Copy {
      dst: dst.view(),
      src: src.view(),
    };
    self.submit(mem, KernelKind::Copy, cmd, launch)
  }

  fn execute_sync(&mut self, mem: &mut MemoryManager, stream: StreamId) -> PimResult<()> {
    let pending = self.pending(stream);
    self.drain(mem, stream)?;
    log::debug!("{}: synchronized {} command(s)", stream, pending);
    Ok(())
  }

  fn execute_dummy(&mut self) -> PimResult<()> {
    self.dummy_calls += 1;
    log::debug!("dummy kernel #{}", self.dummy_calls);
    Ok(())
  }
}

impl SoftExecutor {
  #[allow(clippy::too_many_arguments)]
  fn issue_pim_gemv(
    &mut self,
    mem: &mut MemoryManager,
    kind: KernelKind,
    [out, vector, weight]: [&PimBuffer; 3],
    layout: &GemvLayout,
    list: usize,
    accumulate: bool,
    launch: Launch,
  ) -> PimResult<()> {
    check_pim_gemv(out, vector, weight, layout, list)?;
    let cmd = Command::PimGemv {
      out: out.view(),
      vector: vector.view(),
      weight: weight.view(),
      layout: layout.clone(),
      list,
      accumulate,
    };
    self.submit(mem, kind, cmd, launch)
  }
}

fn check_elementwise(out: &PimBuffer, inputs: &[&PimBuffer]) -> PimResult<()> {
  let len = out.desc().real().len();
  for input in inputs {
    if input.desc().real().len() < len {
      return Err(PimError::invalid(format!(
        "operand holds {} elements, output needs {}",
        input.desc().real().len(),
        len
      )));
    }
  }
  Ok(())
}

fn binary(mem: &mut MemoryManager, out: &PimBuffer, a: &PimBuffer, b: &PimBuffer, f: impl Fn(f32, f32) -> f32) -> PimResult<()> {
  let len = out.desc().real().len();
  let lhs = mem.read_f32s(a)?;
  let rhs = mem.read_f32s(b)?;
  let values: Vec<f32> = lhs.iter().zip(&rhs).take(len).map(|(&x, &y)| f(x, y)).collect();
  mem.write_f32s(out, &values)
}

fn batch_norm(mem: &mut MemoryManager, out: &PimBuffer, input: &PimBuffer, params: [&PimBuffer; 4], epsilon: f64) -> PimResult<()> {
  let [beta, gamma, mean, variance] = params.map(|p| mem.read_f32s(p));
  let (beta, gamma, mean, variance) = (beta?, gamma?, mean?, variance?);
  let shape = input.desc().real();
  let plane = shape.h * shape.w;
  let x = mem.read_f32s(input)?;
  let y: Vec<f32> = x
    .iter()
    .enumerate()
    .take(out.desc().real().len())
    .map(|(i, &v)| {
      let c = (i / plane.max(1)) % shape.c.max(1);
      let inv_std = 1.0 / (variance[c] as f64 + epsilon).sqrt();
      (gamma[c] as f64 * (v as f64 - mean[c] as f64) * inv_std + beta[c] as f64) as f32
    })
    .collect();
  mem.write_f32s(out, &y)
}

/// Rows of `vector` (one per batch entry) and elements per row.
fn vector_rows(vector: &PimBuffer) -> (usize, usize) {
  let req = vector.desc().requested();
  (req.rows(), req.w)
}

fn check_pim_gemv(out: &PimBuffer, vector: &PimBuffer, weight: &PimBuffer, layout: &GemvLayout, list: usize) -> PimResult<()> {
  let per_granule = layout.granule_bytes() / weight.precision().size();
  let in_w = layout.in_granules() * per_granule;
  let (vec_rows, vec_w) = vector_rows(vector);
  let out_req = out.desc().requested();
  if list == 0 || layout.out_rows() % list != 0 {
    return Err(PimError::invalid(format!("{} weight rows cannot hold {} matrices", layout.out_rows(), list)));
  }
  let rows = layout.out_rows() / list;
  if vec_w != in_w {
    return Err(PimError::invalid(format!("vector width {} != weight width {}", vec_w, in_w)));
  }
  if out_req.w != rows {
    return Err(PimError::invalid(format!("output width {} != weight rows {}", out_req.w, rows)));
  }
  let needed_out = if list > 1 { list } else { vec_rows };
  if out_req.rows() < needed_out || (list > 1 && vec_rows != 1 && vec_rows != list) {
    return Err(PimError::invalid(format!(
      "{} vector row(s) and {} output row(s) for a list of {}",
      vec_rows,
      out_req.rows(),
      list
    )));
  }
  if weight.size_bytes() < layout.reordered_len() {
    return Err(PimError::invalid("reordered weight is shorter than its layout"));
  }
  Ok(())
}

/// Accumulate every bank-local granule product into its output row.
fn pim_gemv(
  mem: &mut MemoryManager,
  out: &PimBuffer,
  vector: &PimBuffer,
  weight: &PimBuffer,
  layout: &GemvLayout,
  list: usize,
  accumulate: bool,
) -> PimResult<()> {
  let precision = weight.precision();
  let esize = precision.size();
  let gran = layout.granule_bytes();
  let per_granule = gran / esize;
  let in_g = layout.in_granules();
  let out_rows = layout.out_rows();
  let rows_per_entry = out_rows / list;
  let (vec_rows, _) = vector_rows(vector);
  let x_stride = vector.desc().real().w;
  let o_stride = out.desc().real().w;
  let batches = if list > 1 { 1 } else { vec_rows };

  let x = mem.read_f32s(vector)?;
  let mut acc = vec![0f32; batches * out_rows];
  {
    let w = mem.read_bytes(weight)?;
    layout.visit::<PimError, _>(|p| {
      let row = p.src_granule / in_g;
      let g = p.src_granule % in_g;
      let d = p.dst_offset as usize;
      let granule = w
        .get(d..d + gran)
        .ok_or_else(|| PimError::CopyFailure(format!("weight granule at {:#x} out of range", d)))?;
      for bi in 0..batches {
        let x_row = match (list > 1, vec_rows == list) {
          (true, true) => row / rows_per_entry,
          (true, false) => 0,
          (false, _) => bi,
        };
        let start = x_row * x_stride + g * per_granule;
        let xs = x
          .get(start..start + per_granule)
          .ok_or_else(|| PimError::invalid(format!("vector element {} out of range", start)))?;
        let partial: f32 = granule
          .chunks_exact(esize)
          .zip(xs)
          .map(|(c, &xv)| precision.decode(c) * xv)
          .sum();
        acc[bi * out_rows + row] += partial;
      }
      Ok(())
    })?;
  }

  let mut y = mem.read_f32s(out)?;
  for bi in 0..batches {
    for row in 0..out_rows {
      let idx = if list > 1 {
        (row / rows_per_entry) * o_stride + row % rows_per_entry
      } else {
        bi * o_stride + row
      };
      let sum = acc[bi * out_rows + row];
      y[idx] = if accumulate { y[idx] + sum } else { sum };
    }
  }
  mem.write_f32s(out, &y)
}

/// (out_rows, in_cols) of a row-major or transposed weight.
fn weight_dims(weight: &PimBuffer) -> (usize, usize) {
  let req = weight.desc().requested();
  if weight.desc().transposed() {
    (req.w, req.h)
  } else {
    (req.h, req.w)
  }
}

fn check_custom_gemv(out: &PimBuffer, vector: &PimBuffer, weight: &PimBuffer, bias: Option<&PimBuffer>) -> PimResult<()> {
  let (rows, cols) = weight_dims(weight);
  let (vec_rows, vec_w) = vector_rows(vector);
  let out_req = out.desc().requested();
  if vec_w != cols || out_req.w != rows || out_req.rows() < vec_rows {
    return Err(PimError::invalid(format!(
      "gemv shapes do not line up: weight {}x{}, vector {}, output {}",
      rows,
      cols,
      vector.desc().requested(),
      out_req
    )));
  }
  if let Some(bias) = bias {
    if bias.desc().requested().len() < rows {
      return Err(PimError::invalid(format!("bias holds {} values for {} rows", bias.desc().requested().len(), rows)));
    }
  }
  Ok(())
}

fn custom_gemv(
  mem: &mut MemoryManager,
  out: &PimBuffer,
  vector: &PimBuffer,
  weight: &PimBuffer,
  bias: Option<&PimBuffer>,
  accumulate: bool,
  relu: bool,
) -> PimResult<()> {
  let (rows, cols) = weight_dims(weight);
  let transposed = weight.desc().transposed();
  let pitch = weight.desc().real().w;
  let (vec_rows, _) = vector_rows(vector);
  let x_stride = vector.desc().real().w;
  let o_stride = out.desc().real().w;

  let w = mem.read_f32s(weight)?;
  let x = mem.read_f32s(vector)?;
  let b = match bias {
    Some(bias) => Some(mem.read_f32s(bias)?),
    None => None,
  };
  let mut y = mem.read_f32s(out)?;

  for bi in 0..vec_rows {
    let xs = &x[bi * x_stride..bi * x_stride + cols];
    for r in 0..rows {
      let mut sum: f32 = (0..cols)
        .map(|k| {
          let wv = if transposed { w[k * pitch + r] } else { w[r * pitch + k] };
          wv * xs[k]
        })
        .sum();
      if let Some(b) = &b {
        sum += b[r];
      }
      if relu {
        sum = sum.max(0.0);
      }
      let idx = bi * o_stride + r;
      y[idx] = if accumulate { y[idx] + sum } else { sum };
    }
  }
  mem.write_f32s(out, &y)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{BufferDesc, Precision, Residency, Shape4};
  use crate::memdomain::EmulatedBackend;

  fn setup() -> (MemoryManager, SoftExecutor) {
    let mut mem = MemoryManager::new(Box::new(EmulatedBackend::new()), 1, 1 << 12, 64);
    mem.initialize().unwrap();
    let mut exec = SoftExecutor::new();
    exec.initialize().unwrap();
    (mem, exec)
  }

  fn filled(mem: &mut MemoryManager, shape: Shape4, values: &[f32]) -> PimBuffer {
    let buf = mem
      .allocate(&BufferDesc::new(shape, Precision::Fp32, Residency::Pim))
      .unwrap();
    mem.write_f32s(&buf, values).unwrap();
    buf
  }

  #[test]
  fn test_deferred_commands_run_at_sync() {
    let (mut mem, mut exec) = setup();
    let a = filled(&mut mem, Shape4::vector(4), &[1.0, 2.0, 3.0, 4.0]);
    let b = filled(&mut mem, Shape4::vector(4), &[10.0, 20.0, 30.0, 40.0]);
    let out = filled(&mut mem, Shape4::vector(4), &[0.0; 4]);
    let s = StreamId(3);

    exec.execute_add(&mut mem, &out, &a, &b, Launch::deferred(s)).unwrap();
    exec.execute_mul(&mut mem, &out, &out, &b, Launch::deferred(s)).unwrap();
    assert_eq!(exec.pending(s), 2);
    assert_eq!(mem.read_f32s(&out).unwrap(), vec![0.0; 4]);

    exec.execute_sync(&mut mem, s).unwrap();
    assert_eq!(exec.pending(s), 0);
    assert_eq!(exec.launched(), 2);
    assert_eq!(mem.read_f32s(&out).unwrap(), vec![110.0, 440.0, 990.0, 1760.0]);
  }

  #[test]
  fn test_failed_command_keeps_later_work_queued() {
    let (mut mem, mut exec) = setup();
    let a = filled(&mut mem, Shape4::vector(4), &[1.0; 4]);
    let out1 = filled(&mut mem, Shape4::vector(4), &[0.0; 4]);
    let out2 = filled(&mut mem, Shape4::vector(4), &[0.0; 4]);
    let mut gone = mem
      .allocate(&BufferDesc::new(Shape4::vector(4), Precision::Fp32, Residency::Device))
      .unwrap();
    let dangling = gone.view();
    mem.free(&mut gone).unwrap();
    let s = StreamId(5);

    exec.execute_add(&mut mem, &out1, &a, &dangling, Launch::deferred(s)).unwrap();
    exec.execute_add(&mut mem, &out2, &a, &a, Launch::deferred(s)).unwrap();
    assert!(matches!(exec.execute_sync(&mut mem, s), Err(PimError::CopyFailure(_))));
    assert_eq!(exec.pending(s), 1);

    exec.execute_sync(&mut mem, s).unwrap();
    assert_eq!(exec.pending(s), 0);
    assert_eq!(mem.read_f32s(&out2).unwrap(), vec![2.0; 4]);
  }

  #[test]
  fn test_blocking_command_drains_its_stream_first() {
    let (mut mem, mut exec) = setup();
    let a = filled(&mut mem, Shape4::vector(2), &[-1.0, 2.0]);
    let out = filled(&mut mem, Shape4::vector(2), &[0.0; 2]);
    exec.execute_add(&mut mem, &out, &a, &a, Launch::deferred(StreamId(0))).unwrap();
    exec.execute_relu(&mut mem, &out, &out, Launch::blocking(StreamId(0))).unwrap();
    assert_eq!(mem.read_f32s(&out).unwrap(), vec![0.0, 4.0]);
  }

  #[test]
  fn test_batch_norm_per_channel() {
    let (mut mem, mut exec) = setup();
    let x = filled(&mut mem, Shape4::new(1, 2, 1, 2), &[1.0, 3.0, 10.0, 14.0]);
    let beta = filled(&mut mem, Shape4::vector(2), &[0.5, -1.0]);
    let gamma = filled(&mut mem, Shape4::vector(2), &[2.0, 1.0]);
    let mean = filled(&mut mem, Shape4::vector(2), &[2.0, 12.0]);
    let var = filled(&mut mem, Shape4::vector(2), &[1.0, 4.0]);
    let out = filled(&mut mem, Shape4::new(1, 2, 1, 2), &[0.0; 4]);
    let params = BnOperands {
      beta: &beta,
      gamma: &gamma,
      mean: &mean,
      variance: &var,
      epsilon: 0.0,
    };
    exec.execute_bn(&mut mem, &out, &x, params, Launch::blocking(StreamId(0))).unwrap();
    assert_eq!(mem.read_f32s(&out).unwrap(), vec![-1.5, 2.5, -2.0, 0.0]);
  }

  #[test]
  fn test_custom_gemv_transposed_and_fused_bias() {
    let (mut mem, mut exec) = setup();
    // W = [[1, 2, 3], [4, 5, 6]] stored as [in][out]
    let w = mem
      .allocate(&BufferDesc::new(Shape4::new(1, 1, 3, 2), Precision::Fp32, Residency::Device).with_transposed(true))
      .unwrap();
    mem.write_f32s(&w, &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]).unwrap();
    let x = filled(&mut mem, Shape4::vector(3), &[1.0, 0.0, -1.0]);
    let out = filled(&mut mem, Shape4::vector(2), &[0.0; 2]);
    exec.execute_custom_gemv(&mut mem, &out, &x, &w, false, Launch::blocking(StreamId(0))).unwrap();
    assert_eq!(mem.read_f32s(&out).unwrap(), vec![-2.0, -2.0]);

    let bias = filled(&mut mem, Shape4::vector(2), &[1.0, 3.0]);
    exec
      .execute_custom_gemv_add(&mut mem, &out, &x, &w, &bias, true, Launch::blocking(StreamId(0)))
      .unwrap();
    assert_eq!(mem.read_f32s(&out).unwrap(), vec![0.0, 1.0]);
  }

  #[test]
  fn test_shape_errors_are_reported_at_issue() {
    let (mut mem, mut exec) = setup();
    let a = filled(&mut mem, Shape4::vector(2), &[0.0; 2]);
    let out = filled(&mut mem, Shape4::vector(4), &[0.0; 4]);
    assert!(matches!(
      exec.execute_add(&mut mem, &out, &a, &a, Launch::deferred(StreamId(0))),
      Err(PimError::InvalidConfiguration(_))
    ));
    assert_eq!(exec.pending(StreamId(0)), 0);
  }

  #[test]
  fn test_uninitialized_executor_rejects_launches() {
    let (mut mem, _) = setup();
    let mut exec = SoftExecutor::new();
    let a = filled(&mut mem, Shape4::vector(2), &[0.0; 2]);
    assert!(matches!(
      exec.execute_relu(&mut mem, &a, &a, Launch::blocking(StreamId(0))),
      Err(PimError::NotInitialized)
    ));
    exec.execute_dummy().unwrap();
    assert_eq!(exec.dummy_calls(), 1);
    assert_eq!(exec.launched(), 0);
  }
}
