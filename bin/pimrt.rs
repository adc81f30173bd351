use clap::{Parser, Subcommand};
use pimrt::config::{apply_cli_overrides, load_and_merge_configs, validate_config, AppConfig};
use pimrt::shell::run_shell;
use pimrt::utils::log::{init_log, set_quiet};
use pimrt::workload::{run_elementwise, run_gemv, EltOp, GemvJob};
use pimrt::{KernelMode, PimResult, Precision, Runtime};
use std::path::PathBuf;

/// pimrt - processing-in-memory tensor runtime
#[derive(Parser, Debug)]
#[command(name = "pimrt")]
#[command(version = "0.1.0")]
#[command(about = "Dispatch tensor operations onto PIM DRAM banks", long_about = None)]
struct Args {
  /// TOML file layered over the built-in defaults
  #[arg(short, long, value_name = "FILE", global = true)]
  config: Option<PathBuf>,

  /// Quiet mode (warnings and errors only)
  #[arg(short, long, global = true)]
  quiet: bool,

  /// Kernel selection: optimal, force-pim or force-custom
  #[arg(short, long, value_name = "MODE", global = true)]
  mode: Option<KernelMode>,

  /// Write one JSON line per dispatch decision
  #[arg(long, value_name = "FILE", global = true)]
  trace_file: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the active topology and derived tile sizes
  Topology,
  /// Run GEMV against a host reference
  Gemv {
    #[arg(long = "in", value_name = "N", default_value_t = 1024)]
    in_w: usize,
    #[arg(long = "out", value_name = "M", default_value_t = 4096)]
    out_w: usize,
    #[arg(long, default_value_t = 1)]
    batch: usize,
    #[arg(long)]
    precision: Option<Precision>,
    /// Store the weight as [in][out]
    #[arg(long)]
    transposed: bool,
    #[arg(long, default_value_t = 1)]
    repeat: usize,
  },
  /// Run one element-wise op
  Elt {
    #[arg(long, value_name = "OP", default_value = "add")]
    op: EltOp,
    #[arg(long, default_value_t = 4096)]
    len: usize,
  },
  /// Interactive shell
  Shell,
}

fn print_topology(config: &AppConfig) -> PimResult<()> {
  let topo = &config.topology;
  let text = toml::to_string_pretty(topo).map_err(|e| pimrt::PimError::Config(e.to_string()))?;
  println!("[topology]\n{}", text);
  println!("# input tile      {} granules ({} bytes)", topo.in_tile(), topo.in_tile() * topo.transfer_granularity);
  println!("# output tile     {} rows", topo.out_tile());
  println!("# row bytes       {}", topo.row_bytes());
  println!("# capacity bytes  {}", topo.capacity_bytes());
  Ok(())
}

fn start(config: AppConfig) -> PimResult<Runtime> {
  let mut rt = Runtime::simulated(config)?;
  rt.initialize()?;
  Ok(rt)
}

fn main() -> PimResult<()> {
  init_log();

  let args = Args::parse();

  let mut config = load_and_merge_configs(args.config.as_deref())?;
  let precision = match &args.command {
    Some(Command::Gemv { precision, .. }) => *precision,
    _ => None,
  };
  apply_cli_overrides(&mut config, args.quiet, args.mode, precision, args.trace_file.as_deref());
  validate_config(&config)?;
  set_quiet(config.runtime.quiet);

  match args.command.unwrap_or(Command::Topology) {
    Command::Topology => print_topology(&config)?,
    Command::Gemv {
      in_w,
      out_w,
      batch,
      transposed,
      repeat,
      ..
    } => {
      let mut rt = start(config)?;
      let job = GemvJob {
        in_w,
        out_w,
        batch,
        transposed,
        repeat,
      };
      let report = run_gemv(&mut rt, &job)?;
      let text = serde_json::to_string_pretty(&report).map_err(std::io::Error::from)?;
      println!("{}", text);
      rt.deinitialize()?;
    },
    Command::Elt { op, len } => {
      let mut rt = start(config)?;
      let err = run_elementwise(&mut rt, op, len)?;
      println!("{:?} over {} elements: max rel err {:.3e}", op, len, err);
      rt.deinitialize()?;
    },
    Command::Shell => {
      let mut rt = start(config)?;
      run_shell(&mut rt)?;
      rt.deinitialize()?;
    },
  }
  Ok(())
}
