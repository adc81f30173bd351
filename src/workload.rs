/// Canned workloads driven through the public runtime surface.
///
/// Used by the `pimrt` binary and the interactive shell; every operand lives in
/// device memory and results are checked against a host reference.
use serde::Serialize;

use crate::buffer::{BufferDesc, PimBuffer, Residency, Shape4};
use crate::error::{PimError, PimResult};
use crate::executor::StreamId;
use crate::runtime::{Operation, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemvJob {
  pub in_w: usize,
  pub out_w: usize,
  pub batch: usize,
  /// Store the weight as `[in][out]`.
  pub transposed: bool,
  pub repeat: usize,
}

impl GemvJob {
  pub fn new(in_w: usize, out_w: usize) -> Self {
    Self {
      in_w,
      out_w,
      batch: 1,
      transposed: false,
      repeat: 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GemvReport {
  /// Largest `|got - want| / max(|want|, 1)` over all calls.
  pub max_rel_err: f32,
  pub pim: u64,
  pub fallback: u64,
  pub conversions: u64,
  pub hits: u64,
}

/// Element-wise op selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltOp {
  Add,
  Mul,
  Relu,
}

impl std::str::FromStr for EltOp {
  type Err = PimError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "add" => Ok(EltOp::Add),
      "mul" => Ok(EltOp::Mul),
      "relu" => Ok(EltOp::Relu),
      other => Err(PimError::invalid(format!("unknown element-wise op: {}", other))),
    }
  }
}

/// Values in {-1, 0, 1}; `seed` keeps differently shaped operands apart.
pub fn ternary(len: usize, seed: u64) -> Vec<f32> {
  (0..len as u64)
    .map(|i| ((i.wrapping_mul(2_654_435_761) ^ seed.wrapping_mul(40_503)) % 3) as f32 - 1.0)
    .collect()
}

/// `want[b][r] = sum_k w[r][k] * x[b][k]` for a row-major `w`.
pub fn reference_gemv(weight: &[f32], vector: &[f32], in_w: usize, out_w: usize, batch: usize) -> Vec<f32> {
  let mut out = vec![0f32; batch * out_w];
  for b in 0..batch {
    let xs = &vector[b * in_w..(b + 1) * in_w];
    for r in 0..out_w {
      out[b * out_w + r] = weight[r * in_w..(r + 1) * in_w].iter().zip(xs).map(|(w, x)| w * x).sum();
    }
  }
  out
}

pub fn max_rel_err(got: &[f32], want: &[f32]) -> f32 {
  got
    .iter()
    .zip(want)
    .map(|(g, w)| (g - w).abs() / w.abs().max(1.0))
    .fold(0.0, f32::max)
}

fn transpose(rows: usize, cols: usize, data: &[f32]) -> Vec<f32> {
  let mut t = vec![0f32; data.len()];
  for r in 0..rows {
    for c in 0..cols {
      t[c * rows + r] = data[r * cols + c];
    }
  }
  t
}

/// Run `job.repeat` GEMV calls on one weight and compare each against the host.
pub fn run_gemv(rt: &mut Runtime, job: &GemvJob) -> PimResult<GemvReport> {
  if job.in_w == 0 || job.out_w == 0 || job.batch == 0 {
    return Err(PimError::invalid("gemv dimensions must be non-zero"));
  }
  let precision = rt.config().runtime.precision;
  let seed = (job.in_w * 31 + job.out_w) as u64;
  let weight_vals = ternary(job.out_w * job.in_w, seed);
  let vector_vals = ternary(job.batch * job.in_w, seed + 1);
  let want = reference_gemv(&weight_vals, &vector_vals, job.in_w, job.out_w, job.batch);

  let weight_desc = if job.transposed {
    BufferDesc::new(Shape4::new(1, 1, job.in_w, job.out_w), precision, Residency::Device).with_transposed(true)
  } else {
    BufferDesc::new(Shape4::new(1, 1, job.out_w, job.in_w), precision, Residency::Device)
  };
  let mut weight = rt.allocate(&weight_desc)?;
  let mut vector = rt.allocate(&BufferDesc::new(Shape4::new(job.batch, 1, 1, job.in_w), precision, Residency::Device))?;
  let mut out = rt.allocate(&BufferDesc::new(Shape4::new(job.batch, 1, 1, job.out_w), precision, Residency::Device))?;

  let result = gemv_calls(rt, job, &weight, &vector, &out, &weight_vals, &vector_vals, &want);
  for buf in [&mut weight, &mut vector, &mut out] {
    if let Err(e) = rt.free(buf) {
      log::warn!("workload buffer not freed: {}", e);
    }
  }
  let max_err = result?;

  let stats = rt.stats();
  Ok(GemvReport {
    max_rel_err: max_err,
    pim: stats.pim,
    fallback: stats.fallback,
    conversions: rt.bundles().conversions(),
    hits: rt.bundles().hits(),
  })
}

#[allow(clippy::too_many_arguments)]
fn gemv_calls(
  rt: &mut Runtime,
  job: &GemvJob,
  weight: &PimBuffer,
  vector: &PimBuffer,
  out: &PimBuffer,
  weight_vals: &[f32],
  vector_vals: &[f32],
  want: &[f32],
) -> PimResult<f32> {
  if job.transposed {
    rt.write_f32s(weight, &transpose(job.out_w, job.in_w, weight_vals))?;
  } else {
    rt.write_f32s(weight, weight_vals)?;
  }
  rt.write_f32s(vector, vector_vals)?;

  let mut worst = 0f32;
  for _ in 0..job.repeat.max(1) {
    rt.execute(Operation::Gemv { out, vector, weight }, StreamId::default(), true)?;
    let got = rt.read_f32s(out)?;
    worst = worst.max(max_rel_err(&got, want));
  }
  Ok(worst)
}

/// Run one element-wise op over `len` values; returns the max error.
pub fn run_elementwise(rt: &mut Runtime, op: EltOp, len: usize) -> PimResult<f32> {
  if len == 0 {
    return Err(PimError::invalid("element-wise length must be non-zero"));
  }
  let precision = rt.config().runtime.precision;
  let desc = BufferDesc::new(Shape4::vector(len), precision, Residency::Device);
  let a_vals = ternary(len, len as u64);
  let b_vals = ternary(len, len as u64 + 7);
  let want: Vec<f32> = a_vals
    .iter()
    .zip(&b_vals)
    .map(|(a, b)| match op {
      EltOp::Add => a + b,
      EltOp::Mul => a * b,
      EltOp::Relu => a.max(0.0),
    })
    .collect();

  let mut bufs = Vec::with_capacity(3);
  for _ in 0..3 {
    match rt.allocate(&desc) {
      Ok(buf) => bufs.push(buf),
      Err(e) => {
        for mut buf in bufs {
          rt.free(&mut buf).ok();
        }
        return Err(e);
      },
    }
  }

  let result = elementwise_call(rt, op, &bufs, &a_vals, &b_vals, &want);
  for buf in bufs.iter_mut() {
    if let Err(e) = rt.free(buf) {
      log::warn!("workload buffer not freed: {}", e);
    }
  }
  result
}

fn elementwise_call(rt: &mut Runtime, op: EltOp, bufs: &[PimBuffer], a_vals: &[f32], b_vals: &[f32], want: &[f32]) -> PimResult<f32> {
  let (a, b, out) = (&bufs[0], &bufs[1], &bufs[2]);
  rt.write_f32s(a, a_vals)?;
  rt.write_f32s(b, b_vals)?;
  let operation = match op {
    EltOp::Add => Operation::Add { out, a, b },
    EltOp::Mul => Operation::Mul { out, a, b },
    EltOp::Relu => Operation::Relu { out, input: a },
  };
  rt.execute(operation, StreamId::default(), true)?;
  Ok(max_rel_err(&rt.read_f32s(out)?, want))
}
