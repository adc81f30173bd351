/// Weight bundle cache: reordered PIM copies of GEMV weights keyed by content fingerprint.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::buffer::{CopyKind, MemPtr, PimBuffer, Residency};
use crate::error::{PimError, PimResult};
use crate::layout::{GemvLayout, LayoutConverter};
use crate::memdomain::MemoryManager;

/// XOR of the little-endian 32-bit words sampled at a stride of half the word count.
///
/// Only a handful of words are read, so distinct weights that agree at the sampled
/// positions share a fingerprint.
pub fn fingerprint(bytes: &[u8]) -> u32 {
  let words = bytes.len() / 4;
  let step = (words / 2).max(1);
  bytes
    .chunks_exact(4)
    .step_by(step)
    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    .fold(0, |key, word| key ^ word)
}

fn content_digest(bytes: &[u8]) -> [u8; 32] {
  let mut out = [0u8; 32];
  out.copy_from_slice(&Sha256::digest(bytes));
  out
}

/// How a weight is matched against cached bundles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleKeying {
  /// Fingerprint equality alone.
  #[default]
  Sampled,
  /// Fingerprint selects a chain; a full SHA-256 digest must also match.
  Verified,
}

#[derive(Debug)]
pub struct WeightBundle {
  id: u64,
  fingerprint: u32,
  digest: Option<[u8; 32]>,
  reordered_weight: PimBuffer,
  layout: GemvLayout,
  source_input: Option<MemPtr>,
  source_output: Option<MemPtr>,
  list_size: usize,
}

impl WeightBundle {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn fingerprint(&self) -> u32 {
    self.fingerprint
  }

  pub fn digest(&self) -> Option<&[u8; 32]> {
    self.digest.as_ref()
  }

  /// PIM-resident weight in bank-interleaved order. Owned by the cache.
  pub fn reordered_weight(&self) -> &PimBuffer {
    &self.reordered_weight
  }

  pub fn layout(&self) -> &GemvLayout {
    &self.layout
  }

  pub fn source_input(&self) -> Option<MemPtr> {
    self.source_input
  }

  pub fn source_output(&self) -> Option<MemPtr> {
    self.source_output
  }

  pub fn list_size(&self) -> usize {
    self.list_size
  }
}

/// Never evicts; every bundle lives until `release_all`.
#[derive(Debug, Default)]
pub struct BundleCache {
  keying: BundleKeying,
  entries: HashMap<u32, Vec<WeightBundle>>,
  conversions: u64,
  hits: u64,
  next_id: u64,
}

impl BundleCache {
  pub fn new(keying: BundleKeying) -> Self {
    Self {
      keying,
      ..Default::default()
    }
  }

  pub fn keying(&self) -> BundleKeying {
    self.keying
  }

  /// Layout conversions performed so far.
  pub fn conversions(&self) -> u64 {
    self.conversions
  }

  pub fn hits(&self) -> u64 {
    self.hits
  }

  pub fn len(&self) -> usize {
    self.entries.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Return the bundle for `weight`, converting and uploading it on first use.
  pub fn get_or_build(
    &mut self,
    mem: &mut MemoryManager,
    converter: &LayoutConverter,
    weight: &PimBuffer,
    input: Option<&PimBuffer>,
    output: Option<&PimBuffer>,
    list_size: usize,
  ) -> PimResult<&WeightBundle> {
    let (key, digest) = {
      let bytes = mem.read_bytes(weight)?;
      let digest = match self.keying {
        BundleKeying::Sampled => None,
        BundleKeying::Verified => Some(content_digest(bytes)),
      };
      (fingerprint(bytes), digest)
    };

    let idx = match self.find(key, digest.as_ref()) {
      Some(idx) => {
        self.hits += 1;
        log::debug!("bundle hit: fingerprint {:#010x}", key);
        idx
      },
      None => {
        let (reordered_weight, layout) = build(mem, converter, weight)?;
        self.conversions += 1;
        self.next_id += 1;
        let bundle = WeightBundle {
          id: self.next_id,
          fingerprint: key,
          digest,
          reordered_weight,
          layout,
          source_input: input.and_then(PimBuffer::ptr),
          source_output: output.and_then(PimBuffer::ptr),
          list_size,
        };
        let chain = self.entries.entry(key).or_default();
        chain.push(bundle);
        let idx = chain.len() - 1;
        log::info!(
          "bundle insert: fingerprint {:#010x}, list size {}, {} bundle(s) cached",
          key,
          list_size,
          self.len()
        );
        idx
      },
    };

    self
      .entries
      .get(&key)
      .and_then(|chain| chain.get(idx))
      .ok_or_else(|| PimError::invalid(format!("bundle {:#010x}/{} missing after insert", key, idx)))
  }

  fn find(&self, key: u32, digest: Option<&[u8; 32]>) -> Option<usize> {
    let chain = self.entries.get(&key)?;
    match digest {
      None => (!chain.is_empty()).then_some(0),
      Some(d) => chain.iter().position(|b| b.digest.as_ref() == Some(d)),
    }
  }

  /// Free every reordered weight. Keeps going past failures and reports the first one.
  pub fn release_all(&mut self, mem: &mut MemoryManager) -> PimResult<()> {
    let mut first_err = None;
    let released = self.len();
    for (_, chain) in self.entries.drain() {
      for mut bundle in chain {
        if let Err(e) = mem.free(&mut bundle.reordered_weight) {
          log::error!("failed to release bundle {}: {}", bundle.id, e);
          first_err.get_or_insert(e);
        }
      }
    }
    log::info!("released {} weight bundle(s)", released);
    first_err.map_or(Ok(()), Err)
  }
}

/// Stage the weight on the host, reorder it and upload the result to PIM memory.
/// Host temporaries are released whether or not the build succeeds.
fn build(mem: &mut MemoryManager, converter: &LayoutConverter, weight: &PimBuffer) -> PimResult<(PimBuffer, GemvLayout)> {
  let mut staged = None;
  let mut host_reordered = None;
  let result = stage(mem, converter, weight, &mut staged, &mut host_reordered);
  for mut tmp in staged.into_iter().chain(host_reordered) {
    if let Err(e) = mem.free(&mut tmp) {
      log::warn!("failed to release staging buffer: {}", e);
    }
  }
  result
}

fn stage(
  mem: &mut MemoryManager,
  converter: &LayoutConverter,
  weight: &PimBuffer,
  staged: &mut Option<PimBuffer>,
  host_reordered: &mut Option<PimBuffer>,
) -> PimResult<(PimBuffer, GemvLayout)> {
  if weight.residency() != Residency::Host {
    let tmp = staged.insert(mem.allocate(&weight.desc().with_residency(Residency::Host))?);
    mem.copy(tmp, weight, CopyKind::between(weight.residency(), Residency::Host))?;
  }
  let source = staged.as_ref().unwrap_or(weight);

  let desc = converter.reordered_desc(weight.desc())?;
  let host = host_reordered.insert(mem.allocate(&desc.with_residency(Residency::Host))?);
  let layout = converter.convert_gemv_weight(mem, host, source)?;

  let mut pim = mem.allocate(&desc.with_residency(Residency::Pim))?;
  if let Err(e) = mem.copy(&pim, host, CopyKind::HostToPim) {
    if let Err(free_err) = mem.free(&mut pim) {
      log::warn!("failed to release PIM weight after upload error: {}", free_err);
    }
    return Err(e);
  }
  Ok((pim, layout))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{BufferDesc, Precision, Shape4};
  use crate::layout::GranuleOrder;
  use crate::memdomain::EmulatedBackend;
  use crate::topology::tests::small;

  fn setup() -> (MemoryManager, LayoutConverter) {
    let mut mem = MemoryManager::new(Box::new(EmulatedBackend::new()), 1, 1 << 14, 256);
    mem.initialize().unwrap();
    (mem, LayoutConverter::new(small(), GranuleOrder::Hardware, false))
  }

  fn weight(mem: &mut MemoryManager, residency: Residency, fill: impl Fn(usize) -> f32) -> PimBuffer {
    let desc = BufferDesc::new(Shape4::new(1, 1, 16, 8), Precision::Fp32, residency);
    let buf = mem.allocate(&desc).unwrap();
    let values: Vec<f32> = (0..128).map(fill).collect();
    mem.write_f32s(&buf, &values).unwrap();
    buf
  }

  #[test]
  fn test_fingerprint_samples_two_words() {
    let mut bytes = vec![0u8; 32];
    bytes[0] = 0x01;
    bytes[16] = 0x10;
    assert_eq!(fingerprint(&bytes), 0x11);
    // unsampled word
    bytes[4] = 0xff;
    assert_eq!(fingerprint(&bytes), 0x11);
    assert_eq!(fingerprint(&[]), 0);
  }

  #[test]
  fn test_device_weight_is_staged_and_temporaries_released() {
    let (mut mem, conv) = setup();
    let w = weight(&mut mem, Residency::Device, |d| d as f32);
    let mut cache = BundleCache::new(BundleKeying::Sampled);
    let bundle = cache.get_or_build(&mut mem, &conv, &w, None, None, 1).unwrap();
    assert_eq!(bundle.reordered_weight().residency(), Residency::Pim);
    assert_eq!(bundle.list_size(), 1);
    let reordered = mem.read_f32s(bundle.reordered_weight()).unwrap();
    for p in bundle.layout().placements() {
      assert_eq!(reordered[p.dst_offset as usize / 4], p.src_granule as f32);
    }

    let live = mem.heap(0).unwrap().live_bytes();
    assert_eq!(live, 512);
    cache.release_all(&mut mem).unwrap();
    assert_eq!(mem.heap(0).unwrap().live_bytes(), 0);
    assert!(cache.is_empty());
  }

  #[test]
  fn test_verified_keying_separates_sampled_collisions() {
    let (mut mem, conv) = setup();
    // words 0 and 64 agree, everything else differs
    let a = weight(&mut mem, Residency::Host, |d| d as f32);
    let b = weight(&mut mem, Residency::Host, |d| if d == 0 || d == 64 { d as f32 } else { -(d as f32) });
    assert_eq!(
      fingerprint(mem.read_bytes(&a).unwrap()),
      fingerprint(mem.read_bytes(&b).unwrap())
    );

    let mut cache = BundleCache::new(BundleKeying::Verified);
    let id_a = cache.get_or_build(&mut mem, &conv, &a, None, None, 1).unwrap().id();
    let id_b = cache.get_or_build(&mut mem, &conv, &b, None, None, 1).unwrap().id();
    assert_ne!(id_a, id_b);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get_or_build(&mut mem, &conv, &a, None, None, 1).unwrap().id(), id_a);
    assert_eq!(cache.conversions(), 2);
    assert_eq!(cache.hits(), 1);
  }

  #[test]
  fn test_failed_build_inserts_nothing() {
    let (mut mem, conv) = setup();
    // 12 rows is not a whole output tile
    let desc = BufferDesc::new(Shape4::new(1, 1, 12, 8), Precision::Fp32, Residency::Device);
    let w = mem.allocate(&desc).unwrap();
    let mut cache = BundleCache::new(BundleKeying::Sampled);
    assert!(cache.get_or_build(&mut mem, &conv, &w, None, None, 1).is_err());
    assert!(cache.is_empty());
    assert_eq!(cache.conversions(), 0);
  }
}
