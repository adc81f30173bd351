/// Bank-interleaved placement of GEMV weights.
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use crate::buffer::{BufferDesc, OpKind, PimBuffer, Shape4};
use crate::error::{PimError, PimResult};
use crate::layout::odometer::{Cursor, Odometer};
use crate::memdomain::MemoryManager;
use crate::topology::Topology;

/// Order of the source granules inside one sub-tile.
///
/// The hardware walks `B` weight rows of `A` granules each; the software simulator
/// consumes the transpose of that block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GranuleOrder {
  Hardware,
  #[default]
  Simulator,
}

impl GranuleOrder {
  /// Source granule index for sub-tile element `(a, b)` of the tile starting at weight
  /// row `row` and granule column `x`.
  pub fn source_granule(self, row: usize, x: usize, a: usize, b: usize, in_granules: usize) -> usize {
    match self {
      GranuleOrder::Hardware => (row + b) * in_granules + x + a,
      GranuleOrder::Simulator => (row + a) * in_granules + x + b,
    }
  }
}

/// Where one source granule lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
  pub src_granule: usize,
  pub dst_offset: u64,
  pub channel: usize,
  pub rank: usize,
  pub bank_group: usize,
  pub bank: usize,
  pub row: usize,
  pub col: usize,
}

/// Tiling of one `out_rows x in_granules` weight over the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemvLayout {
  topology: Topology,
  order: GranuleOrder,
  out_rows: usize,
  in_granules: usize,
}

impl GemvLayout {
  pub fn new(topology: &Topology, order: GranuleOrder, out_rows: usize, in_granules: usize) -> PimResult<Self> {
    topology.validate()?;
    if out_rows == 0 || in_granules == 0 {
      return Err(PimError::invalid("empty GEMV weight"));
    }
    if out_rows % topology.out_tile() != 0 {
      return Err(PimError::invalid(format!(
        "{} weight rows are not a multiple of the output tile ({})",
        out_rows,
        topology.out_tile()
      )));
    }
    if in_granules % topology.in_tile() != 0 {
      return Err(PimError::invalid(format!(
        "{} row granules are not a multiple of the input tile ({})",
        in_granules,
        topology.in_tile()
      )));
    }
    if order == GranuleOrder::Simulator && topology.grf_rows_a != topology.grf_rows_b {
      return Err(PimError::invalid("simulator granule order needs grf_rows_a == grf_rows_b"));
    }
    Ok(Self {
      topology: topology.clone(),
      order,
      out_rows,
      in_granules,
    })
  }

  /// Layout of a weight stored as `[rows][w]` over its requested (unpadded) shape.
  pub fn for_weight(topology: &Topology, order: GranuleOrder, desc: &BufferDesc) -> PimResult<Self> {
    let req = desc.requested();
    let row_bytes = req.w * desc.precision().size();
    if row_bytes % topology.transfer_granularity != 0 {
      return Err(PimError::invalid(format!(
        "weight row of {} bytes is not a whole number of {} byte granules",
        row_bytes, topology.transfer_granularity
      )));
    }
    Self::new(topology, order, req.rows(), row_bytes / topology.transfer_granularity)
  }

  pub fn topology(&self) -> &Topology {
    &self.topology
  }

  pub fn order(&self) -> GranuleOrder {
    self.order
  }

  pub fn out_rows(&self) -> usize {
    self.out_rows
  }

  pub fn in_granules(&self) -> usize {
    self.in_granules
  }

  pub fn granule_bytes(&self) -> usize {
    self.topology.transfer_granularity
  }

  /// Bytes the destination must span to receive every placement.
  pub fn reordered_len(&self) -> usize {
    let t = &self.topology;
    let x_tiles = self.in_granules / t.in_tile();
    let y_tiles = self.out_rows / t.out_tile();
    // even tiles are never fewer than odd ones
    let cols = y_tiles * x_tiles.div_ceil(2) * t.grf_rows_a * t.grf_rows_b;
    cols.div_ceil(t.cols_per_row) * t.row_bytes()
  }

  /// Visit every placement in walk order, stopping at the first error.
  pub fn visit<E, F>(&self, mut f: F) -> Result<(), E>
  where
    F: FnMut(&Placement) -> Result<(), E>,
  {
    let t = &self.topology;
    let (grf_a, grf_b) = (t.grf_rows_a, t.grf_rows_b);
    let out_tile = t.out_tile();
    let mut walk = Odometer::new(&[
      (t.banks_per_group(), t.bank_step()),
      (t.bank_groups, 1),
      (t.ranks, 1),
      (t.channels, 1),
    ]);
    // [even, odd]
    let mut cursors = [Cursor::default(); 2];

    for y in (0..self.out_rows).step_by(out_tile) {
      for x in (0..self.in_granules).step_by(grf_a) {
        let parity = (x / grf_a) % 2;
        for tiled_y in (0..out_tile).step_by(grf_b) {
          let mut pos = cursors[parity];
          let (bank, bank_group, rank, channel) = (walk.value(0) + parity, walk.value(1), walk.value(2), walk.value(3));
          for b in 0..grf_b {
            for a in 0..grf_a {
              f(&Placement {
                src_granule: self.order.source_granule(y + tiled_y, x, a, b, self.in_granules),
                dst_offset: t.addr_safe(channel, rank, bank_group, bank, pos.row, pos.col),
                channel,
                rank,
                bank_group,
                bank,
                row: pos.row + pos.col / t.cols_per_row,
                col: pos.col % t.cols_per_row,
              })?;
              pos.advance();
            }
          }
          if walk.tick() {
            cursors[parity] = pos;
          }
        }
      }
    }
    Ok(())
  }

  pub fn placements(&self) -> Vec<Placement> {
    let mut out = Vec::with_capacity(self.out_rows * self.in_granules);
    let walked = self.visit(|p| {
      out.push(*p);
      Ok::<(), Infallible>(())
    });
    match walked {
      Ok(()) => out,
      Err(never) => match never {},
    }
  }
}

/// Rewrites weights from row-major layout into the bank-interleaved layout.
#[derive(Debug, Clone)]
pub struct LayoutConverter {
  topology: Topology,
  order: GranuleOrder,
  repack_in_place: bool,
}

impl LayoutConverter {
  /// With `repack_in_place` the compacted rows of a padded weight are written back over
  /// the source buffer.
  pub fn new(topology: Topology, order: GranuleOrder, repack_in_place: bool) -> Self {
    Self {
      topology,
      order,
      repack_in_place,
    }
  }

  pub fn topology(&self) -> &Topology {
    &self.topology
  }

  pub fn order(&self) -> GranuleOrder {
    self.order
  }

  pub fn layout_for(&self, weight: &BufferDesc) -> PimResult<GemvLayout> {
    GemvLayout::for_weight(&self.topology, self.order, weight)
  }

  /// Descriptor of a buffer able to hold the reordered `weight`.
  pub fn reordered_desc(&self, weight: &BufferDesc) -> PimResult<BufferDesc> {
    let len = self.layout_for(weight)?.reordered_len();
    let precision = weight.precision();
    Ok(BufferDesc::new(
      Shape4::vector(len.div_ceil(precision.size())),
      precision,
      weight.residency(),
    ))
  }

  /// Dispatch on the operation kind. Only single-source GEMV weights are supported.
  pub fn convert_layout(
    &self,
    mem: &mut MemoryManager,
    dst: &PimBuffer,
    src: &PimBuffer,
    src2: Option<&PimBuffer>,
    op: OpKind,
  ) -> PimResult<()> {
    match (op, src2) {
      (OpKind::Gemv, None) => self.convert_gemv_weight(mem, dst, src).map(|_| ()),
      _ => {
        log::warn!("no layout conversion for {}", op);
        Err(PimError::UnsupportedLayout(op))
      },
    }
  }

  /// Scatter every granule of `src` into `dst`.
  ///
  /// A granule that cannot be read or written aborts the walk with `CopyFailure`;
  /// granules already written stay written.
  pub fn convert_gemv_weight(&self, mem: &mut MemoryManager, dst: &PimBuffer, src: &PimBuffer) -> PimResult<GemvLayout> {
    let layout = self.layout_for(src.desc())?;
    let source = self.compact_source(mem, src)?;
    let gran = layout.granule_bytes();
    let target = mem.bytes_mut(dst)?;
    let target_len = target.len();

    layout
      .visit::<PimError, _>(|p| {
        let s = p.src_granule * gran;
        let d = p.dst_offset as usize;
        let from = source
          .get(s..s + gran)
          .ok_or_else(|| PimError::CopyFailure(format!("source granule {} out of range", p.src_granule)))?;
        let to = target.get_mut(d..d + gran).ok_or_else(|| {
          PimError::CopyFailure(format!(
            "granule {} -> {:#x} outside a {} byte destination",
            p.src_granule, d, target_len
          ))
        })?;
        to.copy_from_slice(from);
        Ok(())
      })
      .inspect_err(|e| log::error!("gemv layout conversion aborted: {}", e))?;

    log::debug!(
      "converted {}x{} granule weight into {} bytes",
      layout.out_rows(),
      layout.in_granules(),
      layout.reordered_len()
    );
    Ok(layout)
  }

  fn compact_source(&self, mem: &mut MemoryManager, src: &PimBuffer) -> PimResult<Vec<u8>> {
    let bytes = mem.read_bytes(src)?;
    if !src.desc().is_padded() {
      return Ok(bytes.to_vec());
    }
    let compact = compact_rows(bytes, src.desc());
    if self.repack_in_place {
      log::debug!("repacking padded weight in place");
      mem.write_bytes(src, &compact)?;
    }
    Ok(compact)
  }
}

/// Copy the requested-width rows out of their padded stride.
fn compact_rows(bytes: &[u8], desc: &BufferDesc) -> Vec<u8> {
  let esize = desc.precision().size();
  let (req, real) = (desc.requested(), desc.real());
  let width = req.w * esize;
  let pitch = real.w * esize;
  let mut out = Vec::with_capacity(req.len() * esize);
  for n in 0..req.n {
    for c in 0..req.c {
      for h in 0..req.h {
        let start = ((n * real.c + c) * real.h + h) * pitch;
        out.extend_from_slice(&bytes[start..start + width]);
      }
    }
  }
  out
}
