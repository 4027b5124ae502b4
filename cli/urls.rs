// Copyright 2025 the modcdn authors. MIT license.

use std::collections::BTreeMap;
use std::fmt;

use lazy_regex::regex_captures;

use crate::errors::CdnError;
use crate::version;

/// A recognized, order-sensitive option embedded in the canonical URL's
/// trailing `!!` segment. The set is closed; extending it requires a
/// `cdnv` bump because it changes every canonical URL.
pub struct FlagDef {
  pub key: &'static str,
  pub alias: &'static str,
}

pub static FLAGS: &[FlagDef] = &[
  FlagDef {
    key: "svelte",
    alias: "s",
  },
  FlagDef {
    key: "metadata",
    alias: "md",
  },
];

pub fn key_for_alias(alias: &str) -> Option<&'static str> {
  FLAGS.iter().find(|f| f.alias == alias).map(|f| f.key)
}

pub fn alias_for_key(key: &str) -> Option<&'static str> {
  FLAGS.iter().find(|f| f.key == key).map(|f| f.alias)
}

pub fn flag_value_is_truthy(value: &str) -> bool {
  !matches!(value, "false" | "0" | "null")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registry {
  Npm,
  Github,
}

impl Registry {
  pub fn as_str(&self) -> &'static str {
    match self {
      Registry::Npm => "npm",
      Registry::Github => "github",
    }
  }

  fn from_str(s: &str) -> Option<Self> {
    match s {
      "npm" => Some(Registry::Npm),
      "github" => Some(Registry::Github),
      _ => None,
    }
  }
}

impl fmt::Display for Registry {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A decoded request URL, before version resolution and subpath
/// resolution have run. `canonical` records which grammar matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
  pub registry: Registry,
  pub name: String,
  /// Exact for the canonical grammar; a range or dist-tag (or absent,
  /// meaning `latest`) for the raw grammar.
  pub version: Option<String>,
  /// `.`, `./<path>`, or a `data:` URL.
  pub subpath: String,
  /// Recognized flags only, keyed by flag key.
  pub flags: BTreeMap<String, String>,
  /// Query pairs that are not recognized flags, preserved in order.
  pub query: Vec<(String, String)>,
  pub canonical: bool,
}

/// Parses either grammar. The canonical form is recognized first so that
/// already-canonical URLs are never re-resolved.
pub fn decode(url_path: &str) -> Result<ParsedRequest, CdnError> {
  let invalid = || CdnError::InvalidUrl(url_path.to_string());

  let (path, query_str) = match url_path.split_once('?') {
    Some((path, query)) => (path, Some(query)),
    None => (url_path, None),
  };
  let path = percent_encoding::percent_decode_str(path)
    .decode_utf8()
    .map_err(|_| invalid())?
    .into_owned();

  let mut query = Vec::new();
  let mut query_flags: Vec<(String, String)> = Vec::new();
  if let Some(query_str) = query_str {
    for (key, value) in url::form_urlencoded::parse(query_str.as_bytes()) {
      if key_for_alias(&key).is_some() || alias_for_key(&key).is_some() {
        query_flags.push((key.into_owned(), value.into_owned()));
      } else {
        query.push((key.into_owned(), value.into_owned()));
      }
    }
  }

  let parsed = if path.contains("!!") {
    let (base, tail) = path.split_once("!!").ok_or_else(invalid)?;
    let (_, registry, name, version, subpath) = regex_captures!(
      r"^/(npm|github)/((?:@[^/@]+/)?[^/@!]+)@([^/]+)/(.+)$",
      base
    )
    .ok_or_else(invalid)?;
    let registry = Registry::from_str(registry).ok_or_else(invalid)?;
    if registry == Registry::Npm
      && deno_semver::Version::parse_from_npm(version).is_err()
    {
      return Err(invalid());
    }
    let mut flags = BTreeMap::new();
    let mut saw_build = false;
    for entry in tail.split(';') {
      let (alias, value) = entry.split_once(':').ok_or_else(invalid)?;
      if alias == "cdnv" {
        saw_build = true;
        continue;
      }
      if let Some(key) = key_for_alias(alias) {
        flags.insert(key.to_string(), value.to_string());
      }
      // unknown aliases are dropped
    }
    if !saw_build {
      return Err(invalid());
    }
    ParsedRequest {
      registry,
      name: name.to_string(),
      version: Some(version.to_string()),
      subpath: normalize_subpath(subpath),
      flags,
      query,
      canonical: true,
    }
  } else {
    let (_, registry, name, version, subpath) = regex_captures!(
      r"^/?(?:(npm|github)/)?((?:@[^/@]+/)?[^/@!]+)(?:@([^/]+))?(?:/(.*))?$",
      &path
    )
    .ok_or_else(invalid)?;
    let registry = if registry.is_empty() {
      Registry::Npm
    } else {
      Registry::from_str(registry).ok_or_else(invalid)?
    };
    let mut flags = BTreeMap::new();
    for (key, value) in query_flags {
      match key.as_str() {
        "svelte" => {
          let version = if value.is_empty() {
            "latest".to_string()
          } else {
            value
          };
          flags.insert(key, version);
        }
        "metadata" => {
          if flag_value_is_truthy(&value) {
            let value = if value.is_empty() {
              "1".to_string()
            } else {
              value
            };
            flags.insert(key, value);
          }
        }
        _ => {}
      }
    }
    ParsedRequest {
      registry,
      name: name.to_string(),
      version: if version.is_empty() {
        None
      } else {
        Some(version.to_string())
      },
      subpath: normalize_subpath(subpath),
      flags,
      query,
      canonical: false,
    }
  };

  if !parsed.subpath.starts_with("data:") && parsed.subpath != "." {
    let segments = parsed.subpath[2..].split('/');
    for segment in segments {
      if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment == "node_modules"
      {
        return Err(invalid());
      }
    }
  }
  Ok(parsed)
}

fn normalize_subpath(subpath: &str) -> String {
  if subpath.is_empty() || subpath == "." {
    ".".to_string()
  } else if subpath.starts_with("data:") {
    subpath.to_string()
  } else {
    format!("./{}", subpath.trim_start_matches("./"))
  }
}

/// Renders the one canonical form of a fully resolved request:
/// `/<registry>/<name>@<version>/<subpath>!!cdnv:<build>;<alias>:<value>…`
/// with the flag list lexicographically sorted and any unrecognized query
/// pairs carried after it.
pub fn encode(
  registry: Registry,
  name: &str,
  version: &str,
  subpath: &str,
  flags: &BTreeMap<String, String>,
  query: &[(String, String)],
) -> String {
  let subpath_display = subpath.strip_prefix("./").unwrap_or(subpath);
  let mut entries = vec![format!("cdnv:{}", version::CDN_BUILD)];
  for (key, value) in flags {
    if let Some(alias) = alias_for_key(key) {
      entries.push(format!("{alias}:{value}"));
    }
  }
  entries.sort();
  let mut out = format!(
    "/{}/{}@{}/{}!!{}",
    registry.as_str(),
    name,
    version,
    subpath_display,
    entries.join(";")
  );
  if !query.is_empty() {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.extend_pairs(query.iter().map(|(k, v)| (k, v)));
    out.push('?');
    out.push_str(&serializer.finish());
  }
  out
}
