// Copyright 2025 the modcdn authors. MIT license.

use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

mod resolution;

pub use resolution::resolve_package_subpath;
pub use resolution::EMPTY_MODULE_DATA_URL;

#[derive(Debug, Error)]
pub enum PackageJsonLoadError {
  #[error("failed reading '{}'", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("malformed package.json at '{}'", .path.display())]
  Deserialize {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// The slice of a package manifest the CDN reads. Everything else in the
/// file is ignored on load.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
  pub name: Option<String>,
  pub version: Option<String>,
  /// Legacy single-file component entry. A plain string pointing at the
  /// source `.svelte`/`.js` entry of a component library.
  pub svelte: Option<String>,
  /// Modern conditional exports. Kept as a raw value because the shapes
  /// (string, condition map, subpath map, array) only get decided during
  /// resolution.
  pub exports: Option<Value>,
  /// Either a string entry point or an object-form substitution map.
  pub browser: Option<Value>,
  pub module: Option<String>,
  pub main: Option<String>,
  #[serde(default)]
  pub dependencies: IndexMap<String, String>,
  #[serde(default)]
  pub dev_dependencies: IndexMap<String, String>,
  #[serde(default)]
  pub peer_dependencies: IndexMap<String, String>,
}

impl PackageJson {
  pub fn load(path: &Path) -> Result<Self, PackageJsonLoadError> {
    let text =
      std::fs::read_to_string(path).map_err(|source| PackageJsonLoadError::Io {
        path: path.to_path_buf(),
        source,
      })?;
    serde_json::from_str(&text).map_err(|source| {
      PackageJsonLoadError::Deserialize {
        path: path.to_path_buf(),
        source,
      }
    })
  }

  pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    serde_json::from_value(value)
  }

  /// Looks a bare dependency up across the manifest's dependency maps in
  /// declaration-strength order.
  pub fn dependency_version(&self, name: &str) -> Option<&str> {
    self
      .dependencies
      .get(name)
      .or_else(|| self.dev_dependencies.get(name))
      .or_else(|| self.peer_dependencies.get(name))
      .map(|s| s.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn loads_the_fields_the_resolver_reads() {
    let pkg = PackageJson::from_value(json!({
      "name": "thing",
      "version": "1.2.3",
      "main": "index.js",
      "module": "index.mjs",
      "svelte": "src/index.js",
      "browser": { "./fs.js": false },
      "exports": { ".": { "browser": "./dist/browser.js" } },
      "dependencies": { "a": "^1.0.0" },
      "devDependencies": { "b": "~2.0.0" },
      "peerDependencies": { "c": "3.x" },
      "scripts": { "test": "ignored" },
    }))
    .unwrap();
    assert_eq!(pkg.name.as_deref(), Some("thing"));
    assert_eq!(pkg.main.as_deref(), Some("index.js"));
    assert_eq!(pkg.module.as_deref(), Some("index.mjs"));
    assert_eq!(pkg.svelte.as_deref(), Some("src/index.js"));
    assert!(pkg.exports.is_some());
    assert!(pkg.browser.is_some());
    assert_eq!(pkg.dependency_version("a"), Some("^1.0.0"));
    assert_eq!(pkg.dependency_version("b"), Some("~2.0.0"));
    assert_eq!(pkg.dependency_version("c"), Some("3.x"));
    assert_eq!(pkg.dependency_version("missing"), None);
  }

  #[test]
  fn dependency_order_prefers_dependencies_over_dev_and_peer() {
    let pkg = PackageJson::from_value(json!({
      "dependencies": { "x": "1.0.0" },
      "devDependencies": { "x": "2.0.0", "y": "2.0.0" },
      "peerDependencies": { "x": "3.0.0", "y": "3.0.0" },
    }))
    .unwrap();
    assert_eq!(pkg.dependency_version("x"), Some("1.0.0"));
    assert_eq!(pkg.dependency_version("y"), Some("2.0.0"));
  }
}
