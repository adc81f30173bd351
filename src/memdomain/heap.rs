/// First-fit heap over one device's PIM arena.
use std::collections::BTreeMap;

use crate::error::{PimError, PimResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
  pub offset: u64,
  pub len: u64,
  pub live: bool,
}

/// Carves a fixed arena into disjoint extents.
///
/// Not synchronized: callers serialize access (the manager holds it behind `&mut`).
#[derive(Debug, Clone)]
pub struct FragmentAllocator {
  arena: u64,
  alignment: u64,
  // offset -> (len, live)
  extents: BTreeMap<u64, (u64, bool)>,
}

impl FragmentAllocator {
  pub fn new(arena: u64, alignment: u64) -> Self {
    let mut extents = BTreeMap::new();
    if arena > 0 {
      extents.insert(0, (arena, false));
    }
    Self {
      arena,
      alignment: alignment.max(1),
      extents,
    }
  }

  pub fn arena(&self) -> u64 {
    self.arena
  }

  /// Reserve `size` bytes (rounded up to the alignment) and return the offset.
  pub fn alloc(&mut self, size: u64) -> PimResult<u64> {
    if size == 0 {
      return Err(PimError::AllocationFailure("zero-sized PIM allocation".to_string()));
    }
    let len = size
      .div_ceil(self.alignment)
      .checked_mul(self.alignment)
      .filter(|&len| len <= self.arena)
      .ok_or_else(|| {
        PimError::AllocationFailure(format!("{} bytes exceed the {} byte PIM arena", size, self.arena))
      })?;
    let found = self
      .extents
      .iter()
      .find(|(_, (ext_len, live))| !*live && *ext_len >= len)
      .map(|(&offset, &(ext_len, _))| (offset, ext_len));

    let (offset, ext_len) = found.ok_or_else(|| {
      PimError::AllocationFailure(format!(
        "no free PIM extent of {} bytes ({} of {} free)",
        len,
        self.free_bytes(),
        self.arena
      ))
    })?;

    self.extents.insert(offset, (len, true));
    if ext_len > len {
      self.extents.insert(offset + len, (ext_len - len, false));
    }
    log::debug!("pim heap: alloc {} bytes at {:#x}", len, offset);
    Ok(offset)
  }

  /// Release the live extent starting at `offset` and coalesce with free neighbours.
  pub fn free(&mut self, offset: u64) -> PimResult<()> {
    let len = match self.extents.get(&offset) {
      Some(&(len, true)) => len,
      Some(&(_, false)) => {
        log::warn!("pim heap: double free at {:#x}", offset);
        return Err(PimError::invalid(format!("PIM offset {:#x} is already free", offset)));
      },
      None => {
        log::warn!("pim heap: free of unknown offset {:#x}", offset);
        return Err(PimError::invalid(format!("PIM offset {:#x} was never allocated", offset)));
      },
    };

    let mut start = offset;
    let mut total = len;

    if let Some((&next_off, &(next_len, false))) = self.extents.range(offset + len..).next() {
      if next_off == offset + len {
        self.extents.remove(&next_off);
        total += next_len;
      }
    }
    if let Some((&prev_off, &(prev_len, false))) = self.extents.range(..offset).next_back() {
      if prev_off + prev_len == offset {
        self.extents.remove(&offset);
        start = prev_off;
        total += prev_len;
      }
    }
    self.extents.insert(start, (total, false));
    log::debug!("pim heap: free {} bytes at {:#x}", len, offset);
    Ok(())
  }

  pub fn live_bytes(&self) -> u64 {
    self.extents.values().filter(|(_, live)| *live).map(|(len, _)| len).sum()
  }

  pub fn free_bytes(&self) -> u64 {
    self.arena - self.live_bytes()
  }

  pub fn extents(&self) -> Vec<Extent> {
    self
      .extents
      .iter()
      .map(|(&offset, &(len, live))| Extent { offset, len, live })
      .collect()
  }
}
