use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::buffer::Precision;
use crate::bundle::BundleKeying;
use crate::error::{PimError, PimResult};
use crate::runtime::KernelMode;
use crate::topology::Topology;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Legacy kernel selection variable (`1` = PIM, `2` = custom).
pub const LEGACY_KERNEL_ENV: &str = "PIM_KERNEL_TYPE";

/// Which executor the runtime drives; also picks the granule order of the layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
  Hardware,
  #[default]
  Simulator,
}

/// Runtime section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSection {
  #[serde(default)]
  pub kind: RuntimeKind,
  #[serde(default = "default_precision")]
  pub precision: Precision,
  #[serde(default)]
  pub kernel_mode: KernelMode,
  #[serde(default = "default_devices")]
  pub devices: u32,
  /// PIM arena per device, in bytes.
  #[serde(default = "default_pim_arena_bytes")]
  pub pim_arena_bytes: usize,
  #[serde(default)]
  pub repack_in_place: bool,
  #[serde(default)]
  pub bundle_keying: BundleKeying,
  #[serde(default)]
  pub quiet: bool,
  /// JSON-lines dispatch trace; empty disables it.
  #[serde(default)]
  pub trace_file: String,
}

fn default_precision() -> Precision {
  Precision::Fp16
}

fn default_devices() -> u32 {
  1
}

fn default_pim_arena_bytes() -> usize {
  128 << 20
}

impl Default for RuntimeSection {
  fn default() -> Self {
    Self {
      kind: RuntimeKind::default(),
      precision: default_precision(),
      kernel_mode: KernelMode::default(),
      devices: default_devices(),
      pim_arena_bytes: default_pim_arena_bytes(),
      repack_in_place: false,
      bundle_keying: BundleKeying::default(),
      quiet: false,
      trace_file: String::new(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
  #[serde(default)]
  pub runtime: RuntimeSection,
  #[serde(default)]
  pub topology: Topology,
}

/// Parse the shipped defaults.
pub fn load_default_config() -> PimResult<AppConfig> {
  toml::from_str::<AppConfig>(DEFAULT_CONFIG).map_err(|e| PimError::Config(format!("default.toml: {}", e)))
}

/// Parse one TOML file on its own.
pub fn load_config_file(path: &Path) -> PimResult<AppConfig> {
  let content = std::fs::read_to_string(path)?;
  toml::from_str::<AppConfig>(&content).map_err(|e| PimError::Config(format!("{}: {}", path.display(), e)))
}

/// Layer defaults, an optional file and the environment, then validate.
///
/// Order, lowest precedence first:
/// 1. built-in defaults
/// 2. `custom_config_path`
/// 3. `PIMRT_<SECTION>__<KEY>` variables
/// 4. legacy `PIM_KERNEL_TYPE`
pub fn load_and_merge_configs(custom_config_path: Option<&Path>) -> PimResult<AppConfig> {
  let legacy = std::env::var(LEGACY_KERNEL_ENV).ok();
  let config = layered_config(custom_config_path, None, legacy.as_deref())?;
  validate_config(&config)?;
  Ok(config)
}

/// `env` replaces the process environment when given.
fn layered_config(
  custom_config_path: Option<&Path>,
  env: Option<HashMap<String, String>>,
  legacy_kernel_type: Option<&str>,
) -> PimResult<AppConfig> {
  let mut builder =
    ::config::Config::builder().add_source(::config::File::from_str(DEFAULT_CONFIG, ::config::FileFormat::Toml));
  if let Some(path) = custom_config_path {
    builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Toml));
  }
  builder = builder.add_source(
    ::config::Environment::with_prefix("PIMRT")
      .prefix_separator("_")
      .separator("__")
      .try_parsing(true)
      .source(env),
  );

  let mut config: AppConfig = builder.build()?.try_deserialize()?;
  if let Some(value) = legacy_kernel_type {
    config.runtime.kernel_mode = KernelMode::from_legacy(value);
    log::debug!("{}={} -> {} mode", LEGACY_KERNEL_ENV, value, config.runtime.kernel_mode);
  }
  Ok(config)
}

/// CLI flags win over every other source.
pub fn apply_cli_overrides(
  config: &mut AppConfig,
  quiet: bool,
  mode: Option<KernelMode>,
  precision: Option<Precision>,
  trace_file: Option<&str>,
) {
  if quiet {
    config.runtime.quiet = true;
  }
  if let Some(mode) = mode {
    config.runtime.kernel_mode = mode;
  }
  if let Some(precision) = precision {
    config.runtime.precision = precision;
  }
  if let Some(file) = trace_file {
    config.runtime.trace_file = file.to_string();
  }
}

pub fn validate_config(config: &AppConfig) -> PimResult<()> {
  config.topology.validate()?;
  if config.runtime.devices == 0 {
    return Err(PimError::invalid("at least one device is required"));
  }
  if config.runtime.pim_arena_bytes == 0 {
    return Err(PimError::invalid("pim_arena_bytes must be non-zero"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
    Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
  }

  #[test]
  fn test_default_toml_matches_code_defaults() {
    assert_eq!(load_default_config().unwrap(), AppConfig::default());
  }

  #[test]
  fn test_layer_precedence() {
    let dir = std::env::temp_dir().join(format!("pimrt-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("custom.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[runtime]\nkernel_mode = \"force-custom\"\ndevices = 2\n[topology]\nchannels = 32").unwrap();

    let from_file = layered_config(Some(&path), env(&[]), None).unwrap();
    assert_eq!(from_file.runtime.kernel_mode, KernelMode::ForceCustom);
    assert_eq!(from_file.runtime.devices, 2);
    assert_eq!(from_file.topology.channels, 32);
    assert_eq!(from_file.topology.banks, 16);

    let from_env = layered_config(
      Some(&path),
      env(&[("PIMRT_RUNTIME__KERNEL_MODE", "force-pim"), ("PIMRT_RUNTIME__DEVICES", "4")]),
      None,
    )
    .unwrap();
    assert_eq!(from_env.runtime.kernel_mode, KernelMode::ForcePim);
    assert_eq!(from_env.runtime.devices, 4);

    let legacy = layered_config(Some(&path), env(&[("PIMRT_RUNTIME__KERNEL_MODE", "force-pim")]), Some("2")).unwrap();
    assert_eq!(legacy.runtime.kernel_mode, KernelMode::ForceCustom);

    let mut cli = legacy;
    apply_cli_overrides(&mut cli, true, Some(KernelMode::Optimal), Some(Precision::Fp32), Some("trace.jsonl"));
    assert_eq!(cli.runtime.kernel_mode, KernelMode::Optimal);
    assert_eq!(cli.runtime.precision, Precision::Fp32);
    assert!(cli.runtime.quiet);
    assert_eq!(cli.runtime.trace_file, "trace.jsonl");

    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn test_validate_rejects_bad_geometry_and_arena() {
    let mut config = AppConfig::default();
    validate_config(&config).unwrap();
    config.topology.bank_groups = 3;
    assert!(matches!(validate_config(&config), Err(PimError::InvalidConfiguration(_))));

    let mut config = AppConfig::default();
    config.runtime.pim_arena_bytes = 0;
    assert!(validate_config(&config).is_err());
  }

  #[test]
  fn test_unknown_enum_value_is_config_error() {
    let err = layered_config(None, env(&[("PIMRT_RUNTIME__BUNDLE_KEYING", "exact")]), None).unwrap_err();
    assert!(matches!(err, PimError::Config(_)));
  }
}
