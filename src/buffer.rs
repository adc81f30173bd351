/// Buffer objects: descriptors, residency classes and ownership-tagged handles.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::topology::Topology;

/// Which memory domain a buffer physically lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Residency {
  Host,
  Device,
  Pim,
}

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Precision {
  Int8,
  Fp16,
  Fp32,
}

impl Precision {
  /// Element size in bytes.
  pub fn size(self) -> usize {
    match self {
      Precision::Int8 => 1,
      Precision::Fp16 => 2,
      Precision::Fp32 => 4,
    }
  }

  /// Decode one element starting at `bytes[0]`.
  pub fn decode(self, bytes: &[u8]) -> f32 {
    match self {
      Precision::Int8 => bytes[0] as i8 as f32,
      Precision::Fp16 => half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
      Precision::Fp32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
  }

  /// Encode one element into `out[..self.size()]`. Int8 saturates.
  pub fn encode(self, value: f32, out: &mut [u8]) {
    match self {
      Precision::Int8 => out[0] = value.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8 as u8,
      Precision::Fp16 => out[..2].copy_from_slice(&half::f16::from_f32(value).to_le_bytes()),
      Precision::Fp32 => out[..4].copy_from_slice(&value.to_le_bytes()),
    }
  }
}

impl std::str::FromStr for Precision {
  type Err = crate::error::PimError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "int8" => Ok(Precision::Int8),
      "fp16" => Ok(Precision::Fp16),
      "fp32" => Ok(Precision::Fp32),
      other => Err(crate::error::PimError::invalid(format!("unknown precision: {}", other))),
    }
  }
}

/// Logical 4-d tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape4 {
  pub n: usize,
  pub c: usize,
  pub h: usize,
  pub w: usize,
}

impl Shape4 {
  pub fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
    Self { n, c, h, w }
  }

  /// A plain vector of `w` elements.
  pub fn vector(w: usize) -> Self {
    Self::new(1, 1, 1, w)
  }

  pub fn len(&self) -> usize {
    self.n * self.c * self.h * self.w
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of `w`-rows (everything but the innermost dimension).
  pub fn rows(&self) -> usize {
    self.n * self.c * self.h
  }

  fn covers(&self, other: &Shape4) -> bool {
    self.n >= other.n && self.c >= other.c && self.h >= other.h && self.w >= other.w
  }
}

impl fmt::Display for Shape4 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {}, {}, {})", self.n, self.c, self.h, self.w)
  }
}

/// Operation kinds known to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
  Add,
  Mul,
  Relu,
  BatchNorm,
  Gemv,
  GemvAdd,
  GemvList,
  Copy,
}

impl fmt::Display for OpKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      OpKind::Add => "add",
      OpKind::Mul => "mul",
      OpKind::Relu => "relu",
      OpKind::BatchNorm => "batch-norm",
      OpKind::Gemv => "gemv",
      OpKind::GemvAdd => "gemv-add",
      OpKind::GemvList => "gemv-list",
      OpKind::Copy => "copy",
    };
    f.write_str(name)
  }
}

/// Caller-facing buffer descriptor.
///
/// `real` is the allocated shape and is never smaller than `requested` in any
/// dimension; the byte size always derives from `real`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
  requested: Shape4,
  real: Shape4,
  precision: Precision,
  residency: Residency,
  transposed: bool,
}

impl BufferDesc {
  pub fn new(shape: Shape4, precision: Precision, residency: Residency) -> Self {
    Self {
      requested: shape,
      real: shape,
      precision,
      residency,
      transposed: false,
    }
  }

  /// Descriptor whose row pitch is padded to a whole number of transfer granules.
  pub fn aligned(shape: Shape4, precision: Precision, residency: Residency, topology: &Topology) -> Self {
    let per_granule = (topology.transfer_granularity / precision.size()).max(1);
    let w = shape.w.div_ceil(per_granule) * per_granule;
    Self {
      requested: shape,
      real: Shape4 { w, ..shape },
      precision,
      residency,
      transposed: false,
    }
  }

  /// Descriptor with an explicit padded shape.
  pub fn padded(requested: Shape4, real: Shape4, precision: Precision, residency: Residency) -> Option<Self> {
    if !real.covers(&requested) {
      return None;
    }
    Some(Self {
      requested,
      real,
      precision,
      residency,
      transposed: false,
    })
  }

  /// Mark a GEMV weight whose storage is `[in][out]` instead of `[out][in]`.
  pub fn with_transposed(mut self, transposed: bool) -> Self {
    self.transposed = transposed;
    self
  }

  /// Same shape and precision in another memory domain.
  pub fn with_residency(mut self, residency: Residency) -> Self {
    self.residency = residency;
    self
  }

  pub fn requested(&self) -> Shape4 {
    self.requested
  }

  pub fn real(&self) -> Shape4 {
    self.real
  }

  pub fn precision(&self) -> Precision {
    self.precision
  }

  pub fn residency(&self) -> Residency {
    self.residency
  }

  pub fn transposed(&self) -> bool {
    self.transposed
  }

  pub fn is_padded(&self) -> bool {
    self.requested != self.real
  }

  pub fn size_bytes(&self) -> usize {
    self.real.len() * self.precision.size()
  }
}

/// Backend address of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemPtr {
  pub residency: Residency,
  pub device: u32,
  pub addr: u64,
}

/// Ownership-tagged data handle. Only `Owned` handles are ever released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataHandle {
  Owned(MemPtr),
  Borrowed(MemPtr),
}

impl DataHandle {
  pub fn ptr(&self) -> MemPtr {
    match *self {
      DataHandle::Owned(ptr) | DataHandle::Borrowed(ptr) => ptr,
    }
  }
}

/// One memory allocation plus its logical tensor shape.
#[derive(Debug)]
pub struct PimBuffer {
  desc: BufferDesc,
  handle: Option<DataHandle>,
}

impl PimBuffer {
  pub(crate) fn new(desc: BufferDesc, handle: DataHandle) -> Self {
    Self {
      desc,
      handle: Some(handle),
    }
  }

  /// A buffer object with no backing memory yet.
  pub fn unallocated(desc: BufferDesc) -> Self {
    Self { desc, handle: None }
  }

  /// Non-owning alias of this buffer. Freeing the alias is a no-op.
  pub fn view(&self) -> PimBuffer {
    PimBuffer {
      desc: self.desc,
      handle: self.handle.map(|h| DataHandle::Borrowed(h.ptr())),
    }
  }

  pub fn desc(&self) -> &BufferDesc {
    &self.desc
  }

  pub fn residency(&self) -> Residency {
    self.desc.residency
  }

  pub fn precision(&self) -> Precision {
    self.desc.precision
  }

  pub fn size_bytes(&self) -> usize {
    self.desc.size_bytes()
  }

  pub fn handle(&self) -> Option<DataHandle> {
    self.handle
  }

  pub fn ptr(&self) -> Option<MemPtr> {
    self.handle.map(|h| h.ptr())
  }

  pub fn is_external(&self) -> bool {
    matches!(self.handle, Some(DataHandle::Borrowed(_)))
  }

  pub(crate) fn take_handle(&mut self) -> Option<DataHandle> {
    self.handle.take()
  }
}

/// Copy direction between residency classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
  HostToHost,
  HostToDevice,
  HostToPim,
  DeviceToHost,
  DeviceToDevice,
  DeviceToPim,
  PimToHost,
  PimToDevice,
  PimToPim,
}

impl CopyKind {
  pub fn between(src: Residency, dst: Residency) -> Self {
    use Residency::*;
    match (src, dst) {
      (Host, Host) => CopyKind::HostToHost,
      (Host, Device) => CopyKind::HostToDevice,
      (Host, Pim) => CopyKind::HostToPim,
      (Device, Host) => CopyKind::DeviceToHost,
      (Device, Device) => CopyKind::DeviceToDevice,
      (Device, Pim) => CopyKind::DeviceToPim,
      (Pim, Host) => CopyKind::PimToHost,
      (Pim, Device) => CopyKind::PimToDevice,
      (Pim, Pim) => CopyKind::PimToPim,
    }
  }

  pub fn src(self) -> Residency {
    use CopyKind::*;
    match self {
      HostToHost | HostToDevice | HostToPim => Residency::Host,
      DeviceToHost | DeviceToDevice | DeviceToPim => Residency::Device,
      PimToHost | PimToDevice | PimToPim => Residency::Pim,
    }
  }

  pub fn dst(self) -> Residency {
    use CopyKind::*;
    match self {
      HostToHost | DeviceToHost | PimToHost => Residency::Host,
      HostToDevice | DeviceToDevice | PimToDevice => Residency::Device,
      HostToPim | DeviceToPim | PimToPim => Residency::Pim,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_aligned_desc_pads_row_pitch() {
    let topo = Topology::default();
    let desc = BufferDesc::aligned(Shape4::new(1, 1, 4, 100), Precision::Fp16, Residency::Host, &topo);
    // 32-byte granules hold 16 fp16 elements
    assert_eq!(desc.real().w, 112);
    assert_eq!(desc.requested().w, 100);
    assert!(desc.is_padded());
    assert_eq!(desc.size_bytes(), 4 * 112 * 2);
  }

  #[test]
  fn test_padded_rejects_smaller_real_shape() {
    let req = Shape4::new(1, 1, 4, 8);
    assert!(BufferDesc::padded(req, Shape4::new(1, 1, 2, 8), Precision::Fp32, Residency::Host).is_none());
    assert!(BufferDesc::padded(req, Shape4::new(1, 1, 4, 16), Precision::Fp32, Residency::Host).is_some());
  }

  #[test]
  fn test_view_is_borrowed() {
    let ptr = MemPtr {
      residency: Residency::Device,
      device: 0,
      addr: 7,
    };
    let buf = PimBuffer::new(
      BufferDesc::new(Shape4::vector(4), Precision::Fp32, Residency::Device),
      DataHandle::Owned(ptr),
    );
    assert!(!buf.is_external());
    let alias = buf.view();
    assert!(alias.is_external());
    assert_eq!(alias.ptr(), Some(ptr));
  }

  #[test]
  fn test_copy_kind_round_trips_residency() {
    for src in [Residency::Host, Residency::Device, Residency::Pim] {
      for dst in [Residency::Host, Residency::Device, Residency::Pim] {
        let kind = CopyKind::between(src, dst);
        assert_eq!(kind.src(), src);
        assert_eq!(kind.dst(), dst);
      }
    }
  }

  #[test]
  fn test_precision_codec() {
    let mut buf = [0u8; 4];
    Precision::Fp16.encode(1.5, &mut buf);
    assert_eq!(Precision::Fp16.decode(&buf), 1.5);
    Precision::Int8.encode(300.0, &mut buf);
    assert_eq!(Precision::Int8.decode(&buf), 127.0);
    Precision::Fp32.encode(-0.25, &mut buf);
    assert_eq!(Precision::Fp32.decode(&buf), -0.25);
  }
}
