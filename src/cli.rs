//! Shared command-line plumbing for the proxy binaries.

use log::LevelFilter;

/// Initialize the logger from repeated `-v` occurrences:
/// 0 = ERROR, 1 = WARN, 2 = INFO, 3+ = DEBUG. `RUST_LOG` still overrides.
pub fn init_logging(verbosity: u8) {
  let level = match verbosity {
    0 => LevelFilter::Error,
    1 => LevelFilter::Warn,
    2 => LevelFilter::Info,
    _ => LevelFilter::Debug,
  };
  env_logger::Builder::new()
    .filter_level(level)
    .parse_default_env()
    .init();
}

/// Split the positional `lcm_packages` argument on commas, dropping empty
/// segments.
pub fn split_packages(packages: &str) -> Vec<String> {
  packages
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .collect()
}
