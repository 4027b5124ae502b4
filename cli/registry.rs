// Copyright 2025 the modcdn authors. MIT license.

use std::collections::HashMap;

use deno_semver::Version;
use deno_semver::VersionReq;
use indexmap::IndexMap;
use serde::Deserialize;
use url::Url;

use crate::errors::AnyError;
use crate::errors::CdnError;
use crate::http_util::HttpClient;

/// A package's registry document. The version manifests themselves are
/// never read from here (the installed tree is authoritative); resolution
/// only needs the published version set and the dist-tag table.
#[derive(Debug, Clone, Deserialize)]
pub struct NpmPackageInfo {
  #[serde(default)]
  pub versions: IndexMap<String, serde_json::Value>,
  #[serde(rename = "dist-tags", default)]
  pub dist_tags: HashMap<String, String>,
}

/// Fetches packuments and resolves ranges and dist-tags to exact
/// versions. Nothing is memoized here: the installer and the module cache
/// front all the duplication that matters.
#[derive(Debug)]
pub struct RegistryClient {
  base_url: Url,
  client: HttpClient,
}

impl RegistryClient {
  pub fn new(base_url: &str, client: HttpClient) -> Result<Self, AnyError> {
    // `Url::join` treats a base without a trailing slash as a file and
    // would replace its last path segment.
    let base_url = if base_url.ends_with('/') {
      Url::parse(base_url)?
    } else {
      Url::parse(&format!("{base_url}/"))?
    };
    Ok(Self { base_url, client })
  }

  /// The '/' in scoped package names is always percent encoded; older
  /// third party registries only accept the encoded form while npm and
  /// newer ones accept both.
  fn package_url(&self, name: &str) -> Url {
    const ASCII_SET: percent_encoding::AsciiSet =
      percent_encoding::NON_ALPHANUMERIC
        .remove(b'!')
        .remove(b'\'')
        .remove(b'(')
        .remove(b')')
        .remove(b'*')
        .remove(b'-')
        .remove(b'.')
        .remove(b'@')
        .remove(b'_')
        .remove(b'~');
    let name = percent_encoding::utf8_percent_encode(name, &ASCII_SET);
    self
      .base_url
      .join(&name.to_string().replace("%2F", "%2f"))
      .unwrap()
  }

  pub async fn package_info(
    &self,
    name: &str,
  ) -> Result<NpmPackageInfo, AnyError> {
    let url = self.package_url(name);
    let bytes = self.client.download_maybe(url).await.map_err(|err| {
      CdnError::VersionUnresolvable {
        spec: name.to_string(),
        reason: format!("{err:#}"),
      }
    })?;
    let Some(bytes) = bytes else {
      return Err(
        CdnError::VersionUnresolvable {
          spec: name.to_string(),
          reason: "package does not exist in the registry".to_string(),
        }
        .into(),
      );
    };
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Resolves a range or dist-tag to an exact version. An already exact
  /// version short-circuits without touching the registry.
  pub async fn resolve_version(
    &self,
    name: &str,
    range_or_tag: &str,
  ) -> Result<String, AnyError> {
    if Version::parse_from_npm(range_or_tag).is_ok() {
      return Ok(range_or_tag.to_string());
    }
    let info = self.package_info(name).await?;
    if let Some(version) = info.dist_tags.get(range_or_tag) {
      return Ok(version.clone());
    }
    let unresolvable = |reason: &str| CdnError::VersionUnresolvable {
      spec: format!("{name}@{range_or_tag}"),
      reason: reason.to_string(),
    };
    let req = VersionReq::parse_from_npm(range_or_tag)
      .map_err(|err| unresolvable(&err.to_string()))?;
    max_satisfying(info.versions.keys().map(|v| v.as_str()), &req)
      .ok_or_else(|| unresolvable("no published version satisfies it").into())
  }
}

fn max_satisfying<'a>(
  versions: impl Iterator<Item = &'a str>,
  req: &VersionReq,
) -> Option<String> {
  versions
    .filter_map(|v| Version::parse_from_npm(v).ok())
    .filter(|v| req.matches(v))
    .max()
    .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn req(text: &str) -> VersionReq {
    VersionReq::parse_from_npm(text).unwrap()
  }

  #[test]
  fn max_satisfying_picks_the_highest_match() {
    let published = ["1.0.0", "1.2.0", "1.3.0", "2.0.0", "not-a-version"];
    assert_eq!(
      max_satisfying(published.iter().copied(), &req("^1.0.0")),
      Some("1.3.0".to_string())
    );
    assert_eq!(
      max_satisfying(published.iter().copied(), &req("~1.2.0")),
      Some("1.2.0".to_string())
    );
    assert_eq!(max_satisfying(published.iter().copied(), &req("^3.0.0")), None);
  }

  #[test]
  fn prereleases_only_match_when_named() {
    let published = ["4.0.0-beta.2", "3.59.2"];
    assert_eq!(
      max_satisfying(published.iter().copied(), &req("^3.0.0")),
      Some("3.59.2".to_string())
    );
    assert_eq!(
      max_satisfying(published.iter().copied(), &req("4.0.0-beta.2")),
      Some("4.0.0-beta.2".to_string())
    );
  }

  #[test]
  fn scoped_package_urls_are_percent_encoded() {
    let client = RegistryClient::new(
      "https://registry.npmjs.org",
      HttpClient::new().unwrap(),
    )
    .unwrap();
    assert_eq!(
      client.package_url("@sveltejs/kit").as_str(),
      "https://registry.npmjs.org/@sveltejs%2fkit"
    );
    assert_eq!(
      client.package_url("left-pad").as_str(),
      "https://registry.npmjs.org/left-pad"
    );
  }
}
