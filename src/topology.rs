/// Static addressing geometry of the PIM device.
use serde::{Deserialize, Serialize};

use crate::error::{PimError, PimResult};

/// Channel / rank / bank-group / bank geometry plus the GRF sizes of the per-bank units.
///
/// Loaded once from configuration and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
  #[serde(default = "default_grf_rows")]
  pub grf_rows_a: usize,
  #[serde(default = "default_grf_rows")]
  pub grf_rows_b: usize,
  #[serde(default = "default_blocks_per_group")]
  pub blocks_per_group: usize,
  #[serde(default = "default_channels")]
  pub channels: usize,
  #[serde(default = "default_ranks")]
  pub ranks: usize,
  #[serde(default = "default_banks")]
  pub banks: usize,
  #[serde(default = "default_bank_groups")]
  pub bank_groups: usize,
  #[serde(default = "default_transfer_granularity")]
  pub transfer_granularity: usize,
  #[serde(default = "default_cols_per_row")]
  pub cols_per_row: usize,
  #[serde(default = "default_rows")]
  pub rows: usize,
}

fn default_grf_rows() -> usize {
  8
}

fn default_blocks_per_group() -> usize {
  8
}

fn default_channels() -> usize {
  64
}

fn default_ranks() -> usize {
  1
}

fn default_banks() -> usize {
  16
}

fn default_bank_groups() -> usize {
  4
}

fn default_transfer_granularity() -> usize {
  32
}

fn default_cols_per_row() -> usize {
  32
}

fn default_rows() -> usize {
  8192
}

impl Default for Topology {
  fn default() -> Self {
    Self {
      grf_rows_a: default_grf_rows(),
      grf_rows_b: default_grf_rows(),
      blocks_per_group: default_blocks_per_group(),
      channels: default_channels(),
      ranks: default_ranks(),
      banks: default_banks(),
      bank_groups: default_bank_groups(),
      transfer_granularity: default_transfer_granularity(),
      cols_per_row: default_cols_per_row(),
      rows: default_rows(),
    }
  }
}

impl Topology {
  pub fn validate(&self) -> PimResult<()> {
    let fields = [
      ("grf_rows_a", self.grf_rows_a),
      ("grf_rows_b", self.grf_rows_b),
      ("blocks_per_group", self.blocks_per_group),
      ("channels", self.channels),
      ("ranks", self.ranks),
      ("banks", self.banks),
      ("bank_groups", self.bank_groups),
      ("transfer_granularity", self.transfer_granularity),
      ("cols_per_row", self.cols_per_row),
      ("rows", self.rows),
    ];
    if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
      return Err(PimError::invalid(format!("topology field {} must be non-zero", name)));
    }
    if self.banks % self.bank_groups != 0 {
      return Err(PimError::invalid(format!(
        "banks ({}) not divisible by bank_groups ({})",
        self.banks, self.bank_groups
      )));
    }
    if self.banks % self.blocks_per_group != 0 {
      return Err(PimError::invalid(format!(
        "banks ({}) not divisible by blocks_per_group ({})",
        self.banks, self.blocks_per_group
      )));
    }
    // odd tiles land on bank + 1, which must stay inside the even tile's slot
    if self.bank_step() < 2 {
      return Err(PimError::invalid(format!(
        "bank step {} leaves no room for odd tiles",
        self.bank_step()
      )));
    }
    if self.banks_per_group() % self.bank_step() != 0 {
      return Err(PimError::invalid(format!(
        "banks per group ({}) not divisible by bank step ({})",
        self.banks_per_group(),
        self.bank_step()
      )));
    }
    Ok(())
  }

  pub fn banks_per_group(&self) -> usize {
    self.banks / self.bank_groups
  }

  /// Distance between two banks served by consecutive sub-tiles.
  pub fn bank_step(&self) -> usize {
    self.banks / self.blocks_per_group
  }

  /// Input tile width in transfer granules.
  pub fn in_tile(&self) -> usize {
    self.grf_rows_a
  }

  /// Output tile height in weight rows.
  pub fn out_tile(&self) -> usize {
    self.grf_rows_b * self.blocks_per_group * self.channels * self.ranks
  }

  /// Bytes covered by one DRAM row across every bank of the device.
  pub fn row_bytes(&self) -> usize {
    self.channels * self.ranks * self.banks * self.cols_per_row * self.transfer_granularity
  }

  /// Byte span of the whole addressable device.
  pub fn capacity_bytes(&self) -> usize {
    self.row_bytes() * self.rows
  }

  /// Byte offset of one granule.
  ///
  /// `bank` is the bank index within its bank group.
  pub fn addr(&self, channel: usize, rank: usize, bank_group: usize, bank: usize, row: usize, col: usize) -> u64 {
    let bank_major = ((row * self.channels + channel) * self.ranks + rank) * self.bank_groups + bank_group;
    let granule = (bank_major * self.banks_per_group() + bank) * self.cols_per_row + col;
    (granule * self.transfer_granularity) as u64
  }

  /// `addr` after folding a column past the end of a row into the following rows.
  pub fn addr_safe(&self, channel: usize, rank: usize, bank_group: usize, bank: usize, row: usize, col: usize) -> u64 {
    let row = row + col / self.cols_per_row;
    let col = col % self.cols_per_row;
    self.addr(channel, rank, bank_group, bank, row, col)
  }
}
