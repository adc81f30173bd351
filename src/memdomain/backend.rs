/// Backend memory API: the per-residency allocate / free / copy primitives.
use std::collections::HashMap;

use crate::buffer::{MemPtr, Residency};
use crate::error::{PimError, PimResult};

/// Raw memory primitives the manager builds on.
///
/// Host and Device memory are allocated by the backend itself. PIM memory is one
/// reserved arena per device; carving it into allocations is the fragment allocator's
/// job, so the backend only sees arena offsets for `Residency::Pim`.
pub trait MemoryBackend {
  /// Reserve the PIM-addressable arena of one device.
  fn reserve_arena(&mut self, device: u32, bytes: usize) -> PimResult<()>;

  /// Drop every arena and outstanding allocation.
  fn release_all(&mut self);

  /// Allocate Host or Device memory.
  fn alloc(&mut self, residency: Residency, device: u32, size: usize) -> PimResult<MemPtr>;

  /// Release Host or Device memory.
  fn free(&mut self, ptr: MemPtr) -> PimResult<()>;

  fn slice(&self, ptr: MemPtr, len: usize) -> PimResult<&[u8]>;

  fn slice_mut(&mut self, ptr: MemPtr, len: usize) -> PimResult<&mut [u8]>;

  /// Copy `len` bytes between two allocations.
  fn copy(&mut self, dst: MemPtr, src: MemPtr, len: usize) -> PimResult<()> {
    let data = self.slice(src, len)?.to_vec();
    self.slice_mut(dst, len)?.copy_from_slice(&data);
    Ok(())
  }
}

/// Backend that emulates every memory domain in host RAM.
#[derive(Debug, Default)]
pub struct EmulatedBackend {
  allocations: HashMap<(Residency, u64), Vec<u8>>,
  arenas: HashMap<u32, Vec<u8>>,
  next_id: u64,
}

impl EmulatedBackend {
  pub fn new() -> Self {
    Self {
      allocations: HashMap::new(),
      arenas: HashMap::new(),
      next_id: 1,
    }
  }

  /// Live Host/Device allocations.
  pub fn allocation_count(&self) -> usize {
    self.allocations.len()
  }
}

fn out_of_range(ptr: MemPtr, len: usize, have: usize) -> PimError {
  PimError::CopyFailure(format!(
    "{:?} access at {:#x}+{} exceeds {} bytes",
    ptr.residency, ptr.addr, len, have
  ))
}

/// Zeroed buffer that reports an unsatisfiable size instead of aborting.
fn zeroed(size: usize, what: &str) -> PimResult<Vec<u8>> {
  let mut data = Vec::new();
  data
    .try_reserve_exact(size)
    .map_err(|e| PimError::AllocationFailure(format!("{} of {} bytes: {}", what, size, e)))?;
  data.resize(size, 0);
  Ok(data)
}

fn range(ptr: MemPtr, offset: usize, len: usize, have: usize) -> PimResult<std::ops::Range<usize>> {
  match offset.checked_add(len) {
    Some(end) if end <= have => Ok(offset..end),
    _ => Err(out_of_range(ptr, len, have)),
  }
}

impl MemoryBackend for EmulatedBackend {
  fn reserve_arena(&mut self, device: u32, bytes: usize) -> PimResult<()> {
    if bytes == 0 {
      return Err(PimError::AllocationFailure(format!("empty PIM arena for device {}", device)));
    }
    let arena = zeroed(bytes, &format!("PIM arena for device {}", device))?;
    self.arenas.insert(device, arena);
    Ok(())
  }

  fn release_all(&mut self) {
    self.allocations.clear();
    self.arenas.clear();
  }

  fn alloc(&mut self, residency: Residency, _device: u32, size: usize) -> PimResult<MemPtr> {
    if residency == Residency::Pim {
      return Err(PimError::AllocationFailure(
        "PIM memory is carved by the fragment allocator".to_string(),
      ));
    }
    let data = zeroed(size, &format!("{:?} allocation", residency))?;
    let addr = self.next_id;
    self.next_id += 1;
    self.allocations.insert((residency, addr), data);
    Ok(MemPtr {
      residency,
      device: 0,
      addr,
    })
  }

  fn free(&mut self, ptr: MemPtr) -> PimResult<()> {
    match self.allocations.remove(&(ptr.residency, ptr.addr)) {
      Some(_) => Ok(()),
      None => Err(PimError::invalid(format!(
        "{:?} pointer {:#x} was not allocated by this backend",
        ptr.residency, ptr.addr
      ))),
    }
  }

  fn slice(&self, ptr: MemPtr, len: usize) -> PimResult<&[u8]> {
    let (base, offset) = match ptr.residency {
      Residency::Pim => (self.arenas.get(&ptr.device), ptr.addr as usize),
      _ => (self.allocations.get(&(ptr.residency, ptr.addr)), 0),
    };
    let base = base.ok_or_else(|| PimError::CopyFailure(format!("dangling {:?} pointer {:#x}", ptr.residency, ptr.addr)))?;
    let range = range(ptr, offset, len, base.len())?;
    Ok(&base[range])
  }

  fn slice_mut(&mut self, ptr: MemPtr, len: usize) -> PimResult<&mut [u8]> {
    let (base, offset) = match ptr.residency {
      Residency::Pim => (self.arenas.get_mut(&ptr.device), ptr.addr as usize),
      _ => (self.allocations.get_mut(&(ptr.residency, ptr.addr)), 0),
    };
    let base = base.ok_or_else(|| PimError::CopyFailure(format!("dangling {:?} pointer {:#x}", ptr.residency, ptr.addr)))?;
    let range = range(ptr, offset, len, base.len())?;
    Ok(&mut base[range])
  }
}
