/// Memory manager: buffer allocation, release and copies across residency classes.
use crate::buffer::{BufferDesc, CopyKind, DataHandle, MemPtr, PimBuffer, Residency};
use crate::error::{PimError, PimResult};
use crate::memdomain::backend::MemoryBackend;
use crate::memdomain::heap::FragmentAllocator;

pub struct MemoryManager {
  backend: Box<dyn MemoryBackend>,
  heaps: Vec<FragmentAllocator>,
  devices: u32,
  device: u32,
  arena_bytes: usize,
  alignment: u64,
}

impl MemoryManager {
  /// `alignment` is the start alignment of every PIM allocation.
  pub fn new(backend: Box<dyn MemoryBackend>, devices: u32, arena_bytes: usize, alignment: u64) -> Self {
    Self {
      backend,
      heaps: Vec::new(),
      devices: devices.max(1),
      device: 0,
      arena_bytes,
      alignment: alignment.clamp(1, arena_bytes.max(1) as u64),
    }
  }

  /// Reserve one PIM arena and one fragment allocator per device.
  pub fn initialize(&mut self) -> PimResult<()> {
    self.heaps.clear();
    for device in 0..self.devices {
      self.backend.reserve_arena(device, self.arena_bytes)?;
      self
        .heaps
        .push(FragmentAllocator::new(self.arena_bytes as u64, self.alignment));
    }
    log::info!(
      "memory manager: {} device(s), {} byte PIM arena each",
      self.devices,
      self.arena_bytes
    );
    Ok(())
  }

  pub fn deinitialize(&mut self) {
    self.heaps.clear();
    self.backend.release_all();
  }

  pub fn device(&self) -> u32 {
    self.device
  }

  pub fn set_device(&mut self, device: u32) -> PimResult<()> {
    if device >= self.devices {
      return Err(PimError::invalid(format!(
        "device {} out of range ({} devices)",
        device, self.devices
      )));
    }
    self.device = device;
    Ok(())
  }

  /// Fragment allocator of one device.
  pub fn heap(&self, device: u32) -> Option<&FragmentAllocator> {
    self.heaps.get(device as usize)
  }

  fn heap_mut(&mut self, device: u32) -> PimResult<&mut FragmentAllocator> {
    self
      .heaps
      .get_mut(device as usize)
      .ok_or_else(|| PimError::invalid(format!("no PIM heap for device {}", device)))
  }

  /// Allocate raw memory of `size` bytes in `residency`.
  pub fn alloc_raw(&mut self, size: usize, residency: Residency) -> PimResult<MemPtr> {
    let device = self.device;
    let ptr = match residency {
      Residency::Pim => {
        let offset = self.heap_mut(device)?.alloc(size as u64)?;
        MemPtr {
          residency,
          device,
          addr: offset,
        }
      },
      _ => self.backend.alloc(residency, device, size)?,
    };
    log::debug!("alloc {:?} {} bytes -> {:#x}", residency, size, ptr.addr);
    Ok(ptr)
  }

  pub fn free_raw(&mut self, ptr: MemPtr) -> PimResult<()> {
    log::debug!("free {:?} {:#x}", ptr.residency, ptr.addr);
    match ptr.residency {
      Residency::Pim => self.heap_mut(ptr.device)?.free(ptr.addr),
      _ => self.backend.free(ptr),
    }
  }

  /// Allocate a buffer object owned by this manager.
  pub fn allocate(&mut self, desc: &BufferDesc) -> PimResult<PimBuffer> {
    let ptr = self.alloc_raw(desc.size_bytes(), desc.residency())?;
    Ok(PimBuffer::new(*desc, DataHandle::Owned(ptr)))
  }

  /// Wrap memory owned elsewhere. The resulting buffer is never released by the runtime.
  pub fn allocate_with_ptr(&mut self, desc: &BufferDesc, ptr: MemPtr) -> PimResult<PimBuffer> {
    if ptr.residency != desc.residency() {
      return Err(PimError::invalid(format!(
        "user pointer is {:?} but descriptor asks for {:?}",
        ptr.residency,
        desc.residency()
      )));
    }
    self
      .backend
      .slice(ptr, desc.size_bytes())
      .map_err(|e| PimError::invalid(format!("user pointer does not cover the buffer: {}", e)))?;
    Ok(PimBuffer::new(*desc, DataHandle::Borrowed(ptr)))
  }

  /// Release a buffer. Borrowed buffers are left untouched.
  pub fn free(&mut self, buf: &mut PimBuffer) -> PimResult<()> {
    match buf.handle() {
      None => Err(PimError::invalid("free of a buffer with no data handle")),
      Some(DataHandle::Borrowed(_)) => Ok(()),
      Some(DataHandle::Owned(ptr)) => {
        self.free_raw(ptr)?;
        buf.take_handle();
        Ok(())
      },
    }
  }

  /// Copy `dst.size_bytes()` bytes from `src` to `dst` through the backend.
  ///
  /// PIM to PIM is a compute operation and is refused here; the runtime routes it to the
  /// executor.
  pub fn copy(&mut self, dst: &PimBuffer, src: &PimBuffer, kind: CopyKind) -> PimResult<()> {
    if kind == CopyKind::PimToPim {
      return Err(PimError::invalid("PIM to PIM copies run on the executor"));
    }
    let (dst_ptr, src_ptr) = check_copy(dst, src, kind)?;
    self
      .backend
      .copy(dst_ptr, src_ptr, dst.size_bytes())
      .inspect_err(|e| log::warn!("copy {:?} failed: {}", kind, e))
  }

  pub fn read_bytes(&self, buf: &PimBuffer) -> PimResult<&[u8]> {
    let ptr = handle_of(buf)?;
    self.backend.slice(ptr, buf.size_bytes())
  }

  pub fn bytes_mut(&mut self, buf: &PimBuffer) -> PimResult<&mut [u8]> {
    let ptr = handle_of(buf)?;
    self.backend.slice_mut(ptr, buf.size_bytes())
  }

  pub fn write_bytes(&mut self, buf: &PimBuffer, data: &[u8]) -> PimResult<()> {
    if data.len() > buf.size_bytes() {
      return Err(PimError::invalid(format!(
        "{} bytes do not fit a {} byte buffer",
        data.len(),
        buf.size_bytes()
      )));
    }
    self.bytes_mut(buf)?[..data.len()].copy_from_slice(data);
    Ok(())
  }

  /// Encode `values` in the buffer's precision, starting at element 0.
  pub fn write_f32s(&mut self, buf: &PimBuffer, values: &[f32]) -> PimResult<()> {
    let precision = buf.precision();
    let esize = precision.size();
    let bytes = self.bytes_mut(buf)?;
    if values.len() * esize > bytes.len() {
      return Err(PimError::invalid(format!(
        "{} elements do not fit a {} byte buffer",
        values.len(),
        bytes.len()
      )));
    }
    for (chunk, &v) in bytes.chunks_exact_mut(esize).zip(values) {
      precision.encode(v, chunk);
    }
    Ok(())
  }

  /// Decode every element of the buffer (real shape) as f32.
  pub fn read_f32s(&self, buf: &PimBuffer) -> PimResult<Vec<f32>> {
    let precision = buf.precision();
    let bytes = self.read_bytes(buf)?;
    Ok(bytes.chunks_exact(precision.size()).map(|c| precision.decode(c)).collect())
  }
}

pub(crate) fn handle_of(buf: &PimBuffer) -> PimResult<MemPtr> {
  buf
    .ptr()
    .ok_or_else(|| PimError::invalid("buffer has no data handle"))
}

fn check_copy(dst: &PimBuffer, src: &PimBuffer, kind: CopyKind) -> PimResult<(MemPtr, MemPtr)> {
  let dst_ptr = handle_of(dst)?;
  let src_ptr = handle_of(src)?;
  if src.residency() != kind.src() || dst.residency() != kind.dst() {
    return Err(PimError::invalid(format!(
      "{:?} does not match {:?} -> {:?}",
      kind,
      src.residency(),
      dst.residency()
    )));
  }
  if src.size_bytes() < dst.size_bytes() {
    return Err(PimError::invalid(format!(
      "source holds {} bytes, destination needs {}",
      src.size_bytes(),
      dst.size_bytes()
    )));
  }
  Ok((dst_ptr, src_ptr))
}
