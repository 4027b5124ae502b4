// Copyright 2025 the modcdn authors. MIT license.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;

use crate::errors::anyhow;
use crate::errors::bail;
use crate::errors::AnyError;
use crate::errors::CdnError;
use crate::errors::Context;
use crate::urls::Registry;

const LOCKFILE_NAME: &str = "package-lock.json";

/// The package manager invocation, kept behind a trait so tests can
/// materialize installs without a real npm on the PATH.
#[async_trait]
pub trait NpmClient: std::fmt::Debug + Send + Sync {
  /// Runs an install inside `dir`, which holds a synthesized
  /// `package.json`. Must populate `node_modules/` and write the
  /// lockfile on success.
  async fn install(&self, dir: &Path) -> Result<(), AnyError>;
}

#[derive(Debug)]
pub struct NpmCli;

#[async_trait]
impl NpmClient for NpmCli {
  async fn install(&self, dir: &Path) -> Result<(), AnyError> {
    let output = tokio::process::Command::new("npm")
      .args(["install", "--ignore-scripts", "--production"])
      .current_dir(dir)
      .output()
      .await
      .context("failed to spawn npm")?;
    if !output.status.success() {
      bail!(
        "npm exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      );
    }
    Ok(())
  }
}

/// Some historical versions only install with an extra transitive
/// constraint pinned next to them.
struct InstallPatch {
  name: &'static str,
  version_prefix: &'static str,
  dep: &'static str,
  req: &'static str,
}

static INSTALL_PATCHES: &[InstallPatch] = &[InstallPatch {
  name: "svelte",
  version_prefix: "3.29.",
  dep: "estree-walker",
  req: "^2.0.0",
}];

type InstallResult = Result<(), Arc<AnyError>>;
type SharedInstall = Shared<BoxFuture<'static, InstallResult>>;

/// Materializes `packages/<name>@<version>/node_modules/<name>/` on
/// first demand. Concurrent calls for the same package version attach to
/// one in-flight install; the lockfile is the installed predicate, so a
/// failed install leaves the directory retryable.
#[derive(Debug)]
pub struct Installer {
  packages_root: PathBuf,
  npm_client: Arc<dyn NpmClient>,
  pending: Arc<Mutex<HashMap<String, SharedInstall>>>,
}

impl Installer {
  pub fn new(packages_root: PathBuf, npm_client: Arc<dyn NpmClient>) -> Self {
    Self {
      packages_root,
      npm_client,
      pending: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn install_dir(&self, name: &str, version: &str) -> PathBuf {
    self.packages_root.join(format!("{name}@{version}"))
  }

  /// The directory the installed package's own files live in.
  pub fn package_root(&self, name: &str, version: &str) -> PathBuf {
    self
      .install_dir(name, version)
      .join("node_modules")
      .join(name)
  }

  pub async fn ensure_installed(
    &self,
    registry: Registry,
    name: &str,
    version: &str,
  ) -> Result<PathBuf, AnyError> {
    let dir = self.install_dir(name, version);
    if dir.join(LOCKFILE_NAME).exists() {
      return Ok(dir);
    }

    let key = format!("{registry}/{name}@{version}");
    let future = {
      let mut pending = self.pending.lock();
      match pending.get(&key) {
        Some(future) => future.clone(),
        None => {
          // The install runs in its own task: a caller going away must
          // not stop a half-done npm invocation being driven to its
          // lockfile. The task clears its own pending entry.
          let npm_client = self.npm_client.clone();
          let install_dir = dir.clone();
          let pending_map = self.pending.clone();
          let task_key = key.clone();
          let name = name.to_string();
          let version = version.to_string();
          let handle = tokio::spawn(async move {
            let result =
              run_install(npm_client, install_dir, registry, name, version)
                .await
                .map_err(Arc::new);
            pending_map.lock().remove(&task_key);
            result
          });
          let future = async move {
            match handle.await {
              Ok(result) => result,
              Err(err) => Err(Arc::new(anyhow!("install task died: {err}"))),
            }
          }
          .boxed()
          .shared();
          pending.insert(key.clone(), future.clone());
          future
        }
      }
    };
    future.await.map_err(|err| {
      AnyError::from(CdnError::InstallFailed {
        package: format!("{name}@{version}"),
        reason: format!("{err:#}"),
      })
    })?;
    Ok(dir)
  }
}

async fn run_install(
  npm_client: Arc<dyn NpmClient>,
  dir: PathBuf,
  registry: Registry,
  name: String,
  version: String,
) -> Result<(), AnyError> {
  tokio::fs::create_dir_all(&dir).await?;
  if dir.join(LOCKFILE_NAME).exists() {
    return Ok(());
  }

  let manifest = synthesize_manifest(registry, &name, &version);
  tokio::fs::write(
    dir.join("package.json"),
    serde_json::to_vec_pretty(&manifest)?,
  )
  .await?;

  npm_client.install(&dir).await?;

  let installed_manifest =
    dir.join("node_modules").join(&name).join("package.json");
  if !installed_manifest.exists() {
    bail!(
      "package manager finished but '{}' is missing",
      installed_manifest.display()
    );
  }
  Ok(())
}

/// One requested package, declared as the sole dependency of a throwaway
/// manifest, plus any patch the allow-list demands for that version.
fn synthesize_manifest(
  registry: Registry,
  name: &str,
  version: &str,
) -> serde_json::Value {
  let dep_value = match registry {
    Registry::Npm => version.to_string(),
    Registry::Github => {
      if version == "latest" {
        format!("github:{name}")
      } else {
        format!("github:{name}#{version}")
      }
    }
  };
  let mut dependencies = serde_json::Map::new();
  dependencies.insert(name.to_string(), dep_value.into());
  for patch in INSTALL_PATCHES {
    if name == patch.name && version.starts_with(patch.version_prefix) {
      dependencies.insert(patch.dep.to_string(), patch.req.into());
    }
  }
  json!({
    "private": true,
    "dependencies": dependencies,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  /// Writes the lockfile and a minimal installed tree, counting how many
  /// times it actually ran.
  #[derive(Debug, Default)]
  struct CountingNpmClient {
    installs: AtomicUsize,
    delay: Option<Duration>,
  }

  #[async_trait]
  impl NpmClient for CountingNpmClient {
    async fn install(&self, dir: &Path) -> Result<(), AnyError> {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      self.installs.fetch_add(1, Ordering::SeqCst);
      let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("package.json"))?)?;
      for (name, _) in manifest["dependencies"].as_object().unwrap() {
        let pkg_dir = dir.join("node_modules").join(name);
        std::fs::create_dir_all(&pkg_dir)?;
        std::fs::write(pkg_dir.join("package.json"), "{}")?;
      }
      std::fs::write(dir.join(LOCKFILE_NAME), "{}")?;
      Ok(())
    }
  }

  #[tokio::test]
  async fn lockfile_short_circuits_reinstall() {
    let root = tempfile::tempdir().unwrap();
    let client = Arc::new(CountingNpmClient::default());
    let installer = Installer::new(root.path().to_path_buf(), client.clone());

    installer
      .ensure_installed(Registry::Npm, "left-pad", "1.3.0")
      .await
      .unwrap();
    installer
      .ensure_installed(Registry::Npm, "left-pad", "1.3.0")
      .await
      .unwrap();
    assert_eq!(client.installs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn concurrent_installs_coalesce() {
    let root = tempfile::tempdir().unwrap();
    let client = Arc::new(CountingNpmClient {
      delay: Some(Duration::from_millis(20)),
      ..Default::default()
    });
    let installer =
      Arc::new(Installer::new(root.path().to_path_buf(), client.clone()));

    let tasks = (0..16).map(|_| {
      let installer = installer.clone();
      tokio::spawn(async move {
        installer
          .ensure_installed(Registry::Npm, "left-pad", "1.3.0")
          .await
          .map(|_| ())
      })
    });
    for task in tasks.collect::<Vec<_>>() {
      task.await.unwrap().unwrap();
    }
    assert_eq!(client.installs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn failed_install_is_retryable() {
    #[derive(Debug, Default)]
    struct FlakyNpmClient {
      calls: AtomicUsize,
    }
    #[async_trait]
    impl NpmClient for FlakyNpmClient {
      async fn install(&self, dir: &Path) -> Result<(), AnyError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
          bail!("network down");
        }
        let pkg_dir = dir.join("node_modules").join("left-pad");
        std::fs::create_dir_all(&pkg_dir)?;
        std::fs::write(pkg_dir.join("package.json"), "{}")?;
        std::fs::write(dir.join(LOCKFILE_NAME), "{}")?;
        Ok(())
      }
    }

    let root = tempfile::tempdir().unwrap();
    let client = Arc::new(FlakyNpmClient::default());
    let installer = Installer::new(root.path().to_path_buf(), client.clone());

    let err = installer
      .ensure_installed(Registry::Npm, "left-pad", "1.3.0")
      .await
      .unwrap_err();
    assert_eq!(crate::errors::http_status(&err), 502);

    installer
      .ensure_installed(Registry::Npm, "left-pad", "1.3.0")
      .await
      .unwrap();
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn synthesized_manifest_declares_exactly_the_requested_dependency() {
    let manifest = synthesize_manifest(Registry::Npm, "left-pad", "1.3.0");
    assert_eq!(
      manifest["dependencies"],
      json!({ "left-pad": "1.3.0" })
    );
  }

  #[test]
  fn synthesized_manifest_applies_the_3_29_patch() {
    let manifest = synthesize_manifest(Registry::Npm, "svelte", "3.29.4");
    assert_eq!(
      manifest["dependencies"],
      json!({ "svelte": "3.29.4", "estree-walker": "^2.0.0" })
    );
    let unpatched = synthesize_manifest(Registry::Npm, "svelte", "3.30.0");
    assert_eq!(unpatched["dependencies"], json!({ "svelte": "3.30.0" }));
  }

  #[test]
  fn github_installs_use_github_protocol_specs() {
    let manifest =
      synthesize_manifest(Registry::Github, "sveltejs/svelte", "v4.0.0");
    assert_eq!(
      manifest["dependencies"],
      json!({ "sveltejs/svelte": "github:sveltejs/svelte#v4.0.0" })
    );
  }
}
