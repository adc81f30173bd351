/// Global logging configuration
use std::sync::Mutex;

use ::log::LevelFilter;

/// Level in force before quiet mode clamped it; `None` while not quiet.
static LOUD_LEVEL: Mutex<Option<LevelFilter>> = Mutex::new(None);

/// Install the `env_logger` backend. `RUST_LOG` wins over the `info` default.
/// Safe to call more than once; later calls are ignored.
pub fn init_log() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp(None)
    .try_init();
}

/// Quiet mode keeps warnings and errors only. Leaving it restores the previous level.
pub fn set_quiet(quiet: bool) {
  let mut saved = LOUD_LEVEL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  match (quiet, *saved) {
    (true, None) => {
      let current = ::log::max_level();
      *saved = Some(current);
      ::log::set_max_level(current.min(LevelFilter::Warn));
    },
    (false, Some(level)) => {
      *saved = None;
      ::log::set_max_level(level);
    },
    _ => {},
  }
}
