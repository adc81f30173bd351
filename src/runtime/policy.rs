/// Path selection between the PIM executor and the fallback kernels.
///
/// Everything here is pure: no memory is touched and nothing is launched.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::buffer::{BufferDesc, Precision};
use crate::error::{PimError, PimResult};
use crate::topology::Topology;

/// Kernel selection mode, read once when the runtime is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelMode {
  #[default]
  Optimal,
  ForcePim,
  ForceCustom,
}

impl KernelMode {
  /// Value of the legacy `PIM_KERNEL_TYPE` variable: 1 forces PIM, 2 forces the custom
  /// kernels, anything else is optimal.
  pub fn from_legacy(value: &str) -> Self {
    match value.trim() {
      "1" => KernelMode::ForcePim,
      "2" => KernelMode::ForceCustom,
      _ => KernelMode::Optimal,
    }
  }
}

impl FromStr for KernelMode {
  type Err = PimError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "optimal" => Ok(KernelMode::Optimal),
      "force-pim" | "pim" => Ok(KernelMode::ForcePim),
      "force-custom" | "custom" => Ok(KernelMode::ForceCustom),
      other => Err(PimError::invalid(format!("unknown kernel mode: {}", other))),
    }
  }
}

impl fmt::Display for KernelMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      KernelMode::Optimal => "optimal",
      KernelMode::ForcePim => "force-pim",
      KernelMode::ForceCustom => "force-custom",
    })
  }
}

/// Why an operation cannot run on the PIM path. Never surfaced as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Infeasible {
  Transposed,
  Precision(Precision),
  Shape(String),
  Alignment(String),
}

impl fmt::Display for Infeasible {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Infeasible::Transposed => f.write_str("weight is transposed"),
      Infeasible::Precision(p) => write!(f, "{:?} operand on the fp16 datapath", p),
      Infeasible::Shape(msg) => write!(f, "shape mismatch: {}", msg),
      Infeasible::Alignment(msg) => write!(f, "misaligned: {}", msg),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  UsePim { reason: String },
  UseFallback { reason: String },
}

impl Decision {
  pub fn is_pim(&self) -> bool {
    matches!(self, Decision::UsePim { .. })
  }

  pub fn reason(&self) -> &str {
    match self {
      Decision::UsePim { reason } | Decision::UseFallback { reason } => reason,
    }
  }

  pub fn path(&self) -> &'static str {
    if self.is_pim() {
      "pim"
    } else {
      "fallback"
    }
  }
}

/// Descriptors of one GEMV call: `output = weight x vector`.
#[derive(Debug, Clone, Copy)]
pub struct GemvOperands<'a> {
  pub output: &'a BufferDesc,
  pub vector: &'a BufferDesc,
  pub weight: &'a BufferDesc,
}

pub fn select_path(mode: KernelMode, topology: &Topology, ops: &GemvOperands<'_>) -> Decision {
  match mode {
    KernelMode::ForceCustom => Decision::UseFallback {
      reason: "custom kernels forced".to_string(),
    },
    KernelMode::ForcePim if !ops.weight.transposed() => Decision::UsePim {
      reason: "pim forced".to_string(),
    },
    _ => match check_gemv_feasible(topology, ops) {
      Ok(()) => Decision::UsePim {
        reason: "feasible".to_string(),
      },
      Err(why) => Decision::UseFallback { reason: why.to_string() },
    },
  }
}

fn check_common(topology: &Topology, ops: &GemvOperands<'_>, rows: usize) -> Result<(), Infeasible> {
  if ops.weight.transposed() {
    return Err(Infeasible::Transposed);
  }
  for desc in [ops.output, ops.vector, ops.weight] {
    if desc.precision() != Precision::Fp16 {
      return Err(Infeasible::Precision(desc.precision()));
    }
  }
  let (w, v, o) = (ops.weight.requested(), ops.vector.requested(), ops.output.requested());
  if rows != o.w {
    return Err(Infeasible::Shape(format!("weight rows {} vs output width {}", rows, o.w)));
  }
  if w.w != v.w {
    return Err(Infeasible::Shape(format!("weight width {} vs vector width {}", w.w, v.w)));
  }
  if rows % topology.out_tile() != 0 {
    return Err(Infeasible::Alignment(format!(
      "{} rows vs output tile {}",
      rows,
      topology.out_tile()
    )));
  }
  let row_bytes = w.w * Precision::Fp16.size();
  if row_bytes % topology.transfer_granularity != 0 || (row_bytes / topology.transfer_granularity) % topology.in_tile() != 0 {
    return Err(Infeasible::Alignment(format!(
      "{} byte rows vs {} granules of {} bytes",
      row_bytes,
      topology.in_tile(),
      topology.transfer_granularity
    )));
  }
  Ok(())
}

/// Single weight matrix `(1, 1, h, w)`, vector `(n, .., w)`, output `(n, .., h)`.
pub fn check_gemv_feasible(topology: &Topology, ops: &GemvOperands<'_>) -> Result<(), Infeasible> {
  let w = ops.weight.requested();
  if w.n * w.c != 1 {
    return Err(Infeasible::Shape(format!("weight {} is not a single matrix", w)));
  }
  check_common(topology, ops, w.h)?;
  let (v, o) = (ops.vector.requested(), ops.output.requested());
  if v.n != o.n {
    return Err(Infeasible::Shape(format!("batch {} vs output batch {}", v.n, o.n)));
  }
  Ok(())
}

/// Stacked weights `(list, 1, h, w)`; every matrix must pass on its own.
pub fn check_gemv_list_feasible(topology: &Topology, ops: &GemvOperands<'_>) -> Result<(), Infeasible> {
  let w = ops.weight.requested();
  let list = w.n;
  if list == 0 || w.c != 1 {
    return Err(Infeasible::Shape(format!("weight list {} is not (list, 1, h, w)", w)));
  }
  check_common(topology, ops, w.h)?;
  let (v, o) = (ops.vector.requested(), ops.output.requested());
  if o.n != list {
    return Err(Infeasible::Shape(format!("{} outputs for {} matrices", o.n, list)));
  }
  if v.n != 1 && v.n != list {
    return Err(Infeasible::Shape(format!("{} vectors for {} matrices", v.n, list)));
  }
  Ok(())
}

/// Activation fused after a GEMV + bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Activation {
  #[default]
  None,
  Relu,
}

impl FromStr for Activation {
  type Err = PimError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "" | "none" => Ok(Activation::None),
      "relu" => Ok(Activation::Relu),
      other => Err(PimError::invalid(format!("unsupported activation: {}", other))),
    }
  }
}

/// Checked description of a fused GEMV + bias (+ activation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedGemv {
  pub rows: usize,
  pub activation: Activation,
}

impl FusedGemv {
  pub fn new(weight: &BufferDesc, bias: &BufferDesc, activation: Activation) -> PimResult<Self> {
    let w = weight.requested();
    let rows = if weight.transposed() { w.w } else { w.h };
    let bias_len = bias.requested().len();
    if bias_len != rows {
      return Err(PimError::invalid(format!(
        "bias holds {} values for a weight with {} rows",
        bias_len, rows
      )));
    }
    Ok(Self { rows, activation })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{Residency, Shape4};
  use crate::topology::tests::small;

  fn desc(shape: Shape4, precision: Precision) -> BufferDesc {
    BufferDesc::new(shape, precision, Residency::Device)
  }

  // small topology: out tile 8 rows, input tile 2 granules of 2 fp16 elements
  fn gemv(rows: usize, cols: usize) -> (BufferDesc, BufferDesc, BufferDesc) {
    (
      desc(Shape4::vector(rows), Precision::Fp16),
      desc(Shape4::vector(cols), Precision::Fp16),
      desc(Shape4::new(1, 1, rows, cols), Precision::Fp16),
    )
  }

  #[test]
  fn test_select_path_modes() {
    let topo = small();
    let (o, v, w) = gemv(16, 8);
    let ops = GemvOperands {
      output: &o,
      vector: &v,
      weight: &w,
    };
    assert!(select_path(KernelMode::Optimal, &topo, &ops).is_pim());
    assert!(!select_path(KernelMode::ForceCustom, &topo, &ops).is_pim());

    let (o, v, w) = gemv(12, 8);
    let ops = GemvOperands {
      output: &o,
      vector: &v,
      weight: &w,
    };
    assert!(!select_path(KernelMode::Optimal, &topo, &ops).is_pim());
    // forcing skips the feasibility check
    assert!(select_path(KernelMode::ForcePim, &topo, &ops).is_pim());
  }

  #[test]
  fn test_force_pim_with_transposed_weight_falls_back() {
    let topo = small();
    let (o, v, _) = gemv(16, 8);
    let w = desc(Shape4::new(1, 1, 8, 16), Precision::Fp16).with_transposed(true);
    let ops = GemvOperands {
      output: &o,
      vector: &v,
      weight: &w,
    };
    let decision = select_path(KernelMode::ForcePim, &topo, &ops);
    assert_eq!(
      decision,
      Decision::UseFallback {
        reason: Infeasible::Transposed.to_string()
      }
    );
  }

  #[test]
  fn test_feasibility_reasons() {
    let topo = small();
    let (o, v, w) = gemv(16, 8);
    let fp32 = desc(Shape4::vector(8), Precision::Fp32);
    let ops = GemvOperands {
      output: &o,
      vector: &fp32,
      weight: &w,
    };
    assert_eq!(check_gemv_feasible(&topo, &ops), Err(Infeasible::Precision(Precision::Fp32)));

    // 6 columns = 3 granules, not a whole input tile
    let (o6, v6, w6) = gemv(16, 6);
    let ops = GemvOperands {
      output: &o6,
      vector: &v6,
      weight: &w6,
    };
    assert!(matches!(check_gemv_feasible(&topo, &ops), Err(Infeasible::Alignment(_))));

    let batched = desc(Shape4::new(2, 1, 1, 8), Precision::Fp16);
    let ops = GemvOperands {
      output: &o,
      vector: &batched,
      weight: &w,
    };
    assert!(matches!(check_gemv_feasible(&topo, &ops), Err(Infeasible::Shape(_))));
    assert!(check_gemv_feasible(
      &topo,
      &GemvOperands {
        output: &o,
        vector: &v,
        weight: &w
      }
    )
    .is_ok());
  }

  #[test]
  fn test_list_check_is_per_matrix() {
    let topo = small();
    let w = desc(Shape4::new(3, 1, 8, 8), Precision::Fp16);
    let v = desc(Shape4::vector(8), Precision::Fp16);
    let o = desc(Shape4::new(3, 1, 1, 8), Precision::Fp16);
    let ops = GemvOperands {
      output: &o,
      vector: &v,
      weight: &w,
    };
    assert!(check_gemv_list_feasible(&topo, &ops).is_ok());

    // 24 stacked rows would tile, but each 12-row matrix does not
    let w12 = desc(Shape4::new(2, 1, 12, 8), Precision::Fp16);
    let o12 = desc(Shape4::new(2, 1, 1, 12), Precision::Fp16);
    let ops = GemvOperands {
      output: &o12,
      vector: &v,
      weight: &w12,
    };
    assert!(check_gemv_list_feasible(&topo, &ops).is_err());
  }

  #[test]
  fn test_activation_and_fused_construction_use_results() {
    assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
    assert!(matches!("gelu".parse::<Activation>(), Err(PimError::InvalidConfiguration(_))));

    let w = desc(Shape4::new(1, 1, 16, 8), Precision::Fp16);
    let bias = desc(Shape4::vector(16), Precision::Fp16);
    assert_eq!(FusedGemv::new(&w, &bias, Activation::Relu).unwrap().rows, 16);
    let short = desc(Shape4::vector(8), Precision::Fp16);
    assert!(FusedGemv::new(&w, &short, Activation::None).is_err());
  }

  #[test]
  fn test_legacy_kernel_type() {
    assert_eq!(KernelMode::from_legacy("1"), KernelMode::ForcePim);
    assert_eq!(KernelMode::from_legacy("2"), KernelMode::ForceCustom);
    assert_eq!(KernelMode::from_legacy("0"), KernelMode::Optimal);
    assert_eq!("force-pim".parse::<KernelMode>().unwrap(), KernelMode::ForcePim);
  }
}
