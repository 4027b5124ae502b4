// Copyright 2025 the modcdn authors. MIT license.

use std::path::Path;

use serde_json::Value;

use crate::PackageJson;

/// Substituted for entries a manifest explicitly maps to `false`.
pub const EMPTY_MODULE_DATA_URL: &str = "data:text/javascript,export {}";

/// Conditions evaluated against conditional exports, in match order.
/// `default` always matches and does not need to be listed.
static EXPORT_CONDITIONS: &[&str] = &["browser", "svelte", "production"];

/// Candidate suffixes probed on disk for subpaths that no manifest field
/// claimed. Order is observable: an exact file wins over an added
/// extension, which wins over a directory index.
static PROBE_SUFFIXES: &[&str] = &["", ".mjs", ".js", "/index.mjs", "/index.js"];

/// Maps `(manifest, subpath)` to the concrete file the CDN should serve,
/// relative to the installed package root.
///
/// Precedence is layered; each step returns on success:
///
/// 1. the legacy `svelte` component field (root subpath only)
/// 2. conditional `exports` (silently falls through on no-match)
/// 3. legacy entry fields `browser`/`module`/`main` (root subpath only)
/// 4. filesystem probing under the package root
/// 5. the object-form `browser` substitution map
/// 6. the subpath unchanged
pub fn resolve_package_subpath(
  pkg: &PackageJson,
  subpath: &str,
  pkg_root: &Path,
) -> String {
  if subpath == "." {
    if let Some(svelte) = &pkg.svelte {
      return with_relative_prefix(svelte);
    }
  }

  if let Some(exports) = &pkg.exports {
    if let Some(target) = package_exports_resolve(exports, subpath) {
      return with_relative_prefix(&target);
    }
  }

  if subpath == "." {
    if let Some(entry) = legacy_main_resolve(pkg) {
      return entry;
    }
  }

  if subpath != "." {
    if let Some(found) = probe_file_system(subpath, pkg_root) {
      return found;
    }
  }

  if let Some(Value::Object(map)) = &pkg.browser {
    match map.get(subpath) {
      Some(Value::String(replacement)) => {
        return with_relative_prefix(replacement);
      }
      Some(Value::Bool(false)) => return EMPTY_MODULE_DATA_URL.to_string(),
      _ => {}
    }
  }

  subpath.to_string()
}

fn with_relative_prefix(path: &str) -> String {
  if path.starts_with("data:") || path.starts_with("./") || path == "." {
    path.to_string()
  } else {
    format!("./{}", path.trim_start_matches('/'))
  }
}

/// Legacy root entry resolution: `browser`, then `module`, then `main`.
/// An object-form `browser` contributes its `"."` value; `false` there
/// means the package wants an empty module in this profile, and a missing
/// or nullish value falls through to the next field.
fn legacy_main_resolve(pkg: &PackageJson) -> Option<String> {
  match &pkg.browser {
    Some(Value::String(entry)) => return Some(with_relative_prefix(entry)),
    Some(Value::Object(map)) => match map.get(".") {
      Some(Value::String(entry)) => return Some(with_relative_prefix(entry)),
      Some(Value::Bool(false)) => {
        return Some(EMPTY_MODULE_DATA_URL.to_string())
      }
      _ => {}
    },
    _ => {}
  }
  if let Some(module) = &pkg.module {
    return Some(with_relative_prefix(module));
  }
  pkg.main.as_ref().map(|main| with_relative_prefix(main))
}

fn probe_file_system(subpath: &str, pkg_root: &Path) -> Option<String> {
  for suffix in PROBE_SUFFIXES {
    let candidate = format!("{subpath}{suffix}");
    let path = pkg_root.join(candidate.trim_start_matches("./"));
    if path.is_file() {
      return Some(with_relative_prefix(&candidate));
    }
  }
  None
}

/// Evaluates a conditional `exports` value at `subpath`. Returns `None`
/// when nothing matches so the caller can fall through to older fields.
fn package_exports_resolve(exports: &Value, subpath: &str) -> Option<String> {
  // Sugar form: a bare target, or a condition map with no "." keys,
  // stands for the root subpath alone.
  let is_subpath_map = match exports {
    Value::Object(map) => map.keys().any(|k| k.starts_with('.')),
    _ => false,
  };
  if !is_subpath_map {
    if subpath != "." {
      return None;
    }
    return resolve_export_target(exports, "");
  }

  let map = exports.as_object().unwrap();
  if let Some(target) = map.get(subpath) {
    if let Some(resolved) = resolve_export_target(target, "") {
      return Some(resolved);
    }
  }

  // Pattern keys: pick the best `*` match the way node does, longest
  // fixed prefix first.
  let mut best_match = "";
  let mut best_match_subpath = "";
  for key in map.keys() {
    let Some(pattern_index) = key.find('*') else {
      continue;
    };
    let key_sub = &key[..pattern_index];
    let pattern_trailer = &key[pattern_index + 1..];
    if subpath.starts_with(key_sub)
      && subpath.len() >= key.len() - 1
      && subpath.ends_with(pattern_trailer)
      && pattern_key_compare(best_match, key) == 1
      && key.rfind('*') == Some(pattern_index)
    {
      best_match = key;
      best_match_subpath =
        &subpath[pattern_index..subpath.len() - pattern_trailer.len()];
    }
  }
  if !best_match.is_empty() {
    let target = map.get(best_match).unwrap();
    return resolve_export_target(target, best_match_subpath);
  }

  None
}

fn resolve_export_target(target: &Value, star_subpath: &str) -> Option<String> {
  match target {
    Value::String(target) => {
      if !target.starts_with("./") {
        return None;
      }
      Some(target.replace('*', star_subpath))
    }
    Value::Object(conditions) => {
      for (condition, value) in conditions {
        if condition == "default"
          || EXPORT_CONDITIONS.contains(&condition.as_str())
        {
          if let Some(resolved) = resolve_export_target(value, star_subpath) {
            return Some(resolved);
          }
        }
      }
      None
    }
    Value::Array(targets) => targets
      .iter()
      .find_map(|target| resolve_export_target(target, star_subpath)),
    _ => None,
  }
}

/// node's PATTERN_KEY_COMPARE: 1 when `b` sorts ahead of `a`.
fn pattern_key_compare(a: &str, b: &str) -> i32 {
  if a.is_empty() {
    return 1;
  }
  let a_pattern_index = a.find('*');
  let b_pattern_index = b.find('*');
  let base_length_a = a_pattern_index.map(|i| i + 1).unwrap_or(a.len());
  let base_length_b = b_pattern_index.map(|i| i + 1).unwrap_or(b.len());
  if base_length_a > base_length_b {
    return -1;
  }
  if base_length_b > base_length_a {
    return 1;
  }
  if a_pattern_index.is_none() {
    return 1;
  }
  if b_pattern_index.is_none() {
    return -1;
  }
  if a.len() > b.len() {
    return -1;
  }
  if b.len() > a.len() {
    return 1;
  }
  0
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use std::path::PathBuf;

  fn pkg(value: serde_json::Value) -> PackageJson {
    PackageJson::from_value(value).unwrap()
  }

  fn no_root() -> PathBuf {
    PathBuf::from("/nonexistent")
  }

  #[test]
  fn svelte_field_wins_for_root_subpath() {
    let pkg = pkg(json!({
      "svelte": "src/index.js",
      "exports": { ".": "./dist/index.js" },
      "main": "index.js",
    }));
    assert_eq!(
      resolve_package_subpath(&pkg, ".", &no_root()),
      "./src/index.js"
    );
  }

  #[test]
  fn svelte_field_does_not_claim_deep_subpaths() {
    let pkg = pkg(json!({
      "svelte": "src/index.js",
      "exports": { "./other.js": "./dist/other.js" },
    }));
    assert_eq!(
      resolve_package_subpath(&pkg, "./other.js", &no_root()),
      "./dist/other.js"
    );
  }

  #[test]
  fn exports_sugar_string() {
    let pkg = pkg(json!({ "exports": "./dist/index.mjs" }));
    assert_eq!(
      resolve_package_subpath(&pkg, ".", &no_root()),
      "./dist/index.mjs"
    );
  }

  #[test]
  fn exports_condition_order_and_default() {
    let pkg = pkg(json!({
      "exports": {
        ".": {
          "node": "./dist/node.js",
          "browser": "./dist/browser.js",
          "default": "./dist/fallback.js",
        }
      }
    }));
    assert_eq!(
      resolve_package_subpath(&pkg, ".", &no_root()),
      "./dist/browser.js"
    );

    let pkg = pkg(json!({
      "exports": { ".": { "node": "./dist/node.js", "default": "./dist/fallback.js" } }
    }));
    assert_eq!(
      resolve_package_subpath(&pkg, ".", &no_root()),
      "./dist/fallback.js"
    );
  }

  #[test]
  fn exports_array_takes_first_resolvable() {
    let pkg = pkg(json!({
      "exports": { ".": [{ "node": "./node.js" }, "./fallback.js"] }
    }));
    assert_eq!(
      resolve_package_subpath(&pkg, ".", &no_root()),
      "./fallback.js"
    );
  }

  #[test]
  fn exports_pattern_best_match() {
    let pkg = pkg(json!({
      "exports": {
        "./*": "./src/*",
        "./features/*.js": "./dist/features/*.js",
      }
    }));
    assert_eq!(
      resolve_package_subpath(&pkg, "./features/a.js", &no_root()),
      "./dist/features/a.js"
    );
    assert_eq!(
      resolve_package_subpath(&pkg, "./util.js", &no_root()),
      "./src/util.js"
    );
  }

  #[test]
  fn exports_no_match_falls_through_to_legacy() {
    let pkg = pkg(json!({
      "exports": { "./only-this.js": "./dist/only-this.js" },
      "main": "index.js",
    }));
    assert_eq!(resolve_package_subpath(&pkg, ".", &no_root()), "./index.js");
  }

  #[test]
  fn legacy_order_browser_module_main() {
    let pkg = pkg(json!({
      "browser": "browser.js",
      "module": "index.mjs",
      "main": "index.js",
    }));
    assert_eq!(resolve_package_subpath(&pkg, ".", &no_root()), "./browser.js");

    let pkg = pkg(json!({ "module": "index.mjs", "main": "index.js" }));
    assert_eq!(resolve_package_subpath(&pkg, ".", &no_root()), "./index.mjs");

    let pkg = pkg(json!({ "main": "index.js" }));
    assert_eq!(resolve_package_subpath(&pkg, ".", &no_root()), "./index.js");
  }

  #[test]
  fn object_browser_false_inlines_an_empty_module() {
    let pkg = pkg(json!({ "browser": { ".": false }, "main": "index.js" }));
    assert_eq!(
      resolve_package_subpath(&pkg, ".", &no_root()),
      EMPTY_MODULE_DATA_URL
    );
  }

  #[test]
  fn object_browser_missing_root_falls_back() {
    let pkg = pkg(json!({
      "browser": { "./fs.js": "./fs-shim.js" },
      "module": "index.mjs",
      "main": "index.js",
    }));
    assert_eq!(resolve_package_subpath(&pkg, ".", &no_root()), "./index.mjs");
  }

  #[test]
  fn probing_prefers_exact_then_extension_then_index() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("lib")).unwrap();
    std::fs::write(root.join("lib/util.js"), "x").unwrap();
    std::fs::create_dir_all(root.join("nested")).unwrap();
    std::fs::write(root.join("nested/index.mjs"), "x").unwrap();

    assert_eq!(
      resolve_package_subpath(&PackageJson::default(), "./lib/util", root),
      "./lib/util.js"
    );
    assert_eq!(
      resolve_package_subpath(&PackageJson::default(), "./nested", root),
      "./nested/index.mjs"
    );
    // Directories themselves never resolve.
    assert_eq!(
      resolve_package_subpath(&PackageJson::default(), "./lib", root),
      "./lib"
    );
  }

  #[test]
  fn browser_map_rewrites_unprobed_subpaths() {
    let pkg = pkg(json!({ "browser": { "./fs.js": "./fs-shim.js" } }));
    assert_eq!(
      resolve_package_subpath(&pkg, "./fs.js", &no_root()),
      "./fs-shim.js"
    );
    let pkg = pkg(json!({ "browser": { "./fs.js": false } }));
    assert_eq!(
      resolve_package_subpath(&pkg, "./fs.js", &no_root()),
      EMPTY_MODULE_DATA_URL
    );
  }

  #[test]
  fn unclaimed_subpath_returned_unchanged() {
    assert_eq!(
      resolve_package_subpath(&PackageJson::default(), "./nope.js", &no_root()),
      "./nope.js"
    );
  }
}
