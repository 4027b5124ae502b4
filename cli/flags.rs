// Copyright 2025 the modcdn authors. MIT license.

use std::path::PathBuf;

use clap::Arg;
use clap::ArgMatches;
use clap::Command;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flags {
  /// TCP port the HTTP server binds.
  pub port: u16,
  /// State root: `packages/` install trees and the cache database live
  /// under this directory.
  pub dir: PathBuf,
  /// Base URL of the npm-compatible registry.
  pub registry_url: String,
  pub log_level: Option<log::Level>,
}

impl Default for Flags {
  fn default() -> Self {
    Self {
      port: 8080,
      dir: PathBuf::from(".modcdn"),
      registry_url: DEFAULT_REGISTRY_URL.to_string(),
      log_level: None,
    }
  }
}

pub fn flags_from_vec(args: Vec<String>) -> Result<Flags, clap::Error> {
  let matches = clap_root().try_get_matches_from(args)?;
  Ok(flags_from_matches(&matches))
}

fn clap_root() -> Command {
  Command::new("modcdn")
    .version(env!("CARGO_PKG_VERSION"))
    .about("On-demand module CDN for npm-style packages")
    .arg(
      Arg::new("port")
        .long("port")
        .short('p')
        .value_parser(clap::value_parser!(u16))
        .default_value("8080")
        .help("Port to listen on"),
    )
    .arg(
      Arg::new("dir")
        .long("dir")
        .value_parser(clap::value_parser!(PathBuf))
        .default_value(".modcdn")
        .help("Directory for installed packages and the module cache"),
    )
    .arg(
      Arg::new("registry-url")
        .long("registry-url")
        .default_value(DEFAULT_REGISTRY_URL)
        .help("Base URL of the package registry"),
    )
    .arg(
      Arg::new("log-level")
        .long("log-level")
        .value_parser(["trace", "debug", "info", "warn", "error"])
        .help("Set log level"),
    )
}

fn flags_from_matches(matches: &ArgMatches) -> Flags {
  Flags {
    port: *matches.get_one::<u16>("port").unwrap(),
    dir: matches.get_one::<PathBuf>("dir").unwrap().clone(),
    registry_url: matches
      .get_one::<String>("registry-url")
      .unwrap()
      .trim_end_matches('/')
      .to_string(),
    log_level: matches
      .get_one::<String>("log-level")
      .map(|level| level.parse().unwrap()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn svec(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn defaults() {
    let flags = flags_from_vec(svec(&["modcdn"])).unwrap();
    assert_eq!(flags, Flags::default());
  }

  #[test]
  fn all_flags() {
    let flags = flags_from_vec(svec(&[
      "modcdn",
      "--port",
      "4000",
      "--dir",
      "/tmp/state",
      "--registry-url",
      "http://127.0.0.1:4260/",
      "--log-level",
      "debug",
    ]))
    .unwrap();
    assert_eq!(flags.port, 4000);
    assert_eq!(flags.dir, PathBuf::from("/tmp/state"));
    // trailing slash is normalized away
    assert_eq!(flags.registry_url, "http://127.0.0.1:4260");
    assert_eq!(flags.log_level, Some(log::Level::Debug));
  }

  #[test]
  fn rejects_unknown_log_level() {
    assert!(flags_from_vec(svec(&["modcdn", "--log-level", "loud"])).is_err());
  }
}
