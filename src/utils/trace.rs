use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::buffer::OpKind;
use crate::error::PimResult;
use crate::executor::Launch;
use crate::runtime::Decision;

/// JSON-lines record of every path decision.
pub struct DispatchTrace {
  path: PathBuf,
  writer: BufWriter<File>,
  seq: u64,
}

impl DispatchTrace {
  /// Truncates an existing file.
  pub fn create(path: &Path) -> PimResult<Self> {
    let file = File::create(path)?;
    log::info!("dispatch trace: {}", path.display());
    Ok(Self {
      path: path.to_path_buf(),
      writer: BufWriter::new(file),
      seq: 0,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn records(&self) -> u64 {
    self.seq
  }

  pub fn record(&mut self, op: OpKind, decision: &Decision, launch: Launch) -> PimResult<()> {
    let entry = json!({
      "seq": self.seq,
      "op": op.to_string(),
      "path": decision.path(),
      "reason": decision.reason(),
      "stream": launch.stream.0,
      "block": launch.block,
    });
    writeln!(self.writer, "{}", entry)?;
    self.writer.flush()?;
    self.seq += 1;
    Ok(())
  }
}
