//! The builder-facing configuration surface: command-line flags, the
//! environment overlay, verbosity, and exit codes.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::level_filters::LevelFilter;

/// Process exit codes of the builder front-end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
  /// Everything succeeded.
  Success,
  /// At least one module failed to compile.
  CompileError,
  /// The repository or a source file could not be read or written.
  IoError,
  /// The command line or environment was malformed.
  ConfigurationError,
}

impl ExitCode {
  /// The numeric code handed to the operating system.
  #[must_use] pub fn code(self) -> i32 {
    match self {
      Self::Success => 0,
      Self::CompileError => 1,
      Self::IoError => 2,
      Self::ConfigurationError => 3,
    }
  }
}

/// Logging verbosity, mapped onto tracing level filters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Verbosity {
  /// Errors only.
  Error,
  /// Warnings and errors.
  Warn,
  /// The default: informational messages and up.
  #[default]
  Info,
  /// Everything, including per-chunk diagnostics.
  Debug,
}

impl Verbosity {
  /// The tracing filter implementing this verbosity.
  #[must_use] pub fn level_filter(self) -> LevelFilter {
    match self {
      Self::Error => LevelFilter::ERROR,
      Self::Warn => LevelFilter::WARN,
      Self::Info => LevelFilter::INFO,
      Self::Debug => LevelFilter::DEBUG,
    }
  }

  fn parse(s: &str) -> Option<Self> {
    match s {
      "error" => Some(Self::Error),
      "warn" => Some(Self::Warn),
      "info" => Some(Self::Info),
      "debug" => Some(Self::Debug),
      _ => None,
    }
  }
}

/// A named module root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRoot {
  /// The root's name, as referenced by module headers.
  pub name: String,
  /// Where the root's sources live.
  pub location: PathBuf,
}

/// Configuration rejections; these exit with
/// [`ExitCode::ConfigurationError`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
  /// A flag was not recognized.
  #[error("unknown option {0}")]
  UnknownOption(String),
  /// A flag's argument was malformed.
  #[error("malformed value for {0}")]
  BadValue(String),
}

/// The settings the core consumes from the builder front-end.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
  /// The module roots, in search order.
  pub roots: Vec<ModuleRoot>,
  /// The module-renames file, if any.
  pub renames: Option<PathBuf>,
  /// Whether to clear the repositories before building.
  pub clear_repositories: bool,
  /// Suppress progress output.
  pub quiet: bool,
  /// Print per-phase timings.
  pub show_timing: bool,
  /// Logging verbosity.
  pub verbosity: Verbosity,
  /// The requested report names.
  pub reports: BTreeSet<String>,
}

impl Config {
  /// Parse command-line arguments, e.g.
  /// `--avail-roots=avail=/usr/share/avail --verbosity=debug`.
  pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
  where I: IntoIterator<Item = S>, S: AsRef<str> {
    let mut config = Self::default();
    for arg in args {
      let arg = arg.as_ref();
      if let Some(list) = arg.strip_prefix("--avail-roots=") {
        config.roots = parse_roots(list)
          .ok_or_else(|| ConfigError::BadValue("--avail-roots".into()))?;
      } else if let Some(path) = arg.strip_prefix("--renames=") {
        config.renames = Some(PathBuf::from(path));
      } else if arg == "--clear-repositories" {
        config.clear_repositories = true;
      } else if arg == "--quiet" {
        config.quiet = true;
      } else if arg == "--show-timing" {
        config.show_timing = true;
      } else if let Some(level) = arg.strip_prefix("--verbosity=") {
        config.verbosity = Verbosity::parse(level)
          .ok_or_else(|| ConfigError::BadValue("--verbosity".into()))?;
      } else if let Some(set) = arg.strip_prefix("--reports=") {
        config.reports = set.split(',')
          .filter(|s| !s.is_empty())
          .map(str::to_string)
          .collect();
      } else {
        return Err(ConfigError::UnknownOption(arg.to_string()))
      }
    }
    Ok(config)
  }

  /// Overlay `AVAIL_ROOTS` and `AVAIL_RENAMES` onto settings the command
  /// line left empty.
  pub fn overlay_env(&mut self) -> Result<(), ConfigError> {
    if self.roots.is_empty() {
      if let Ok(list) = std::env::var("AVAIL_ROOTS") {
        self.roots =
          parse_roots(&list).ok_or_else(|| ConfigError::BadValue("AVAIL_ROOTS".into()))?;
      }
    }
    if self.renames.is_none() {
      if let Ok(path) = std::env::var("AVAIL_RENAMES") {
        self.renames = Some(PathBuf::from(path));
      }
    }
    Ok(())
  }
}

/// Parse a `name=path;name=path` root list.
fn parse_roots(list: &str) -> Option<Vec<ModuleRoot>> {
  list.split(';')
    .filter(|entry| !entry.is_empty())
    .map(|entry| {
      let (name, location) = entry.split_once('=')?;
      if name.is_empty() { return None }
      Some(ModuleRoot { name: name.to_string(), location: PathBuf::from(location) })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_parse() {
    let config = Config::from_args([
      "--avail-roots=avail=/usr/share/avail;examples=./examples",
      "--renames=renames.txt",
      "--clear-repositories",
      "--show-timing",
      "--verbosity=debug",
      "--reports=timing,dispatch",
    ]).expect("parses");
    assert_eq!(config.roots.len(), 2);
    assert_eq!(config.roots[0].name, "avail");
    assert_eq!(config.renames, Some(PathBuf::from("renames.txt")));
    assert!(config.clear_repositories);
    assert!(config.show_timing);
    assert!(!config.quiet);
    assert_eq!(config.verbosity, Verbosity::Debug);
    assert!(config.reports.contains("dispatch"));
  }

  #[test]
  fn bad_flags_are_configuration_errors() {
    assert_eq!(Config::from_args(["--nope"]),
      Err(ConfigError::UnknownOption("--nope".into())));
    assert_eq!(Config::from_args(["--verbosity=chatty"]),
      Err(ConfigError::BadValue("--verbosity".into())));
    assert_eq!(Config::from_args(["--avail-roots=broken"]),
      Err(ConfigError::BadValue("--avail-roots".into())));
    assert_eq!(ExitCode::ConfigurationError.code(), 3);
  }
}
