use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io;

use crate::error::{PimError, PimResult};
use crate::executor::StreamId;
use crate::runtime::{KernelMode, Runtime};
use crate::workload::{run_elementwise, run_gemv, EltOp, GemvJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
  Gemv { in_w: usize, out_w: usize },
  Add(usize),
  Stats,
  Mode(KernelMode),
  Sync,
  Help,
  Quit,
}

const USAGE: &str = "commands: gemv <in> <out>, add <len>, stats, mode <optimal|force-pim|force-custom>, sync, help, q";

fn parse_count(word: Option<&str>, what: &str) -> Result<usize, String> {
  let word = word.ok_or_else(|| format!("'{}' is missing", what))?;
  match word.parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    Ok(_) => Err(format!("{} must be greater than 0", what)),
    Err(e) => Err(format!("invalid {} '{}': {}", what, word, e)),
  }
}

/// Parse one non-empty shell line.
pub fn parse_command(line: &str) -> Result<ShellCommand, String> {
  let mut words = line.split_whitespace();
  let Some(head) = words.next() else {
    return Err("empty command".to_string());
  };
  let cmd = match head {
    "gemv" => ShellCommand::Gemv {
      in_w: parse_count(words.next(), "input width")?,
      out_w: parse_count(words.next(), "output width")?,
    },
    "add" => ShellCommand::Add(parse_count(words.next(), "length")?),
    "stats" => ShellCommand::Stats,
    "mode" => {
      let mode = words.next().ok_or("'mode' requires optimal, force-pim or force-custom")?;
      ShellCommand::Mode(mode.parse::<KernelMode>().map_err(|e| e.to_string())?)
    },
    "sync" => ShellCommand::Sync,
    "help" | "h" => ShellCommand::Help,
    "q" | "quit" => ShellCommand::Quit,
    other => return Err(format!("Unknown command: '{}'. {}", other, USAGE)),
  };
  if let Some(extra) = words.next() {
    return Err(format!("unexpected argument '{}'", extra));
  }
  Ok(cmd)
}

/// Read until a valid command arrives. Ctrl-C and Ctrl-D quit.
pub fn read_command(editor: &mut DefaultEditor) -> io::Result<ShellCommand> {
  loop {
    match editor.readline("(pimrt) ") {
      Ok(line) => {
        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }
        let _ = editor.add_history_entry(trimmed);
        match parse_command(trimmed) {
          Ok(cmd) => return Ok(cmd),
          Err(msg) => eprintln!("Error: {}", msg),
        }
      },
      Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(ShellCommand::Quit),
      Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
    }
  }
}

/// Apply one command. Returns `false` once the shell should exit.
pub fn run_command(rt: &mut Runtime, cmd: ShellCommand) -> PimResult<bool> {
  match cmd {
    ShellCommand::Gemv { in_w, out_w } => {
      let report = run_gemv(rt, &GemvJob::new(in_w, out_w))?;
      println!(
        "gemv {}x{}: max rel err {:.3e}, {} pim / {} fallback",
        out_w, in_w, report.max_rel_err, report.pim, report.fallback
      );
    },
    ShellCommand::Add(len) => {
      let err = run_elementwise(rt, EltOp::Add, len)?;
      println!("add {}: max rel err {:.3e}", len, err);
    },
    ShellCommand::Stats => {
      let stats = rt.stats();
      println!(
        "mode {}: {} pim / {} fallback, {} bundle(s), {} conversions, {} hits",
        rt.mode(),
        stats.pim,
        stats.fallback,
        rt.bundles().len(),
        rt.bundles().conversions(),
        rt.bundles().hits()
      );
    },
    ShellCommand::Mode(mode) => rt.set_mode(mode),
    ShellCommand::Sync => rt.execute_sync(StreamId::default())?,
    ShellCommand::Help => println!("{}", USAGE),
    ShellCommand::Quit => return Ok(false),
  }
  Ok(true)
}

/// Interactive loop over an initialized runtime. Command errors are printed, not fatal.
pub fn run_shell(rt: &mut Runtime) -> PimResult<()> {
  let mut editor = DefaultEditor::new().map_err(|e| PimError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
  println!("{}", USAGE);
  loop {
    let cmd = read_command(&mut editor)?;
    match run_command(rt, cmd) {
      Ok(true) => {},
      Ok(false) => return Ok(()),
      Err(e) => eprintln!("Error: {}", e),
    }
  }
}
