// Copyright 2025 the modcdn authors. MIT license.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;

use crate::errors::bail;
use crate::errors::AnyError;
use crate::errors::Context;
use crate::installer::Installer;
use crate::urls::Registry;

static SVELTE_RUNNER_JS: &str = include_str!("./svelte_runner.js");
static COMPILERS_MANIFEST_JSON: &str = include_str!("./compilers.json");

/// The closed options record of the compile contract. Unknown keys are
/// never passed to a compiler.
#[derive(Debug, Clone, Serialize)]
pub struct CompileOptions {
  pub name: String,
  pub filename: String,
  pub dev: bool,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
  version: String,
  entries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CompilersManifest {
  svelte: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct RunnerOutput {
  code: Option<String>,
  error: Option<String>,
}

/// One pinned compiler version. The thunk is lazy and idempotent: the
/// first compile installs the compiler package and probes its entry file;
/// the resolved handle is cached for the rest of the process.
#[derive(Debug)]
struct CompilerEntry {
  version: String,
  entry_subpaths: Vec<String>,
  loaded: OnceCell<Arc<SvelteCompiler>>,
}

impl CompilerEntry {
  async fn load(
    &self,
    installer: &Installer,
  ) -> Result<Arc<SvelteCompiler>, AnyError> {
    self
      .loaded
      .get_or_try_init(|| async {
        installer
          .ensure_installed(Registry::Npm, "svelte", &self.version)
          .await?;
        let package_root = installer.package_root("svelte", &self.version);
        for subpath in &self.entry_subpaths {
          let entry = package_root.join(subpath);
          if entry.is_file() {
            return Ok(Arc::new(SvelteCompiler { entry }));
          }
        }
        bail!(
          "no compiler entry found for svelte@{} under '{}'",
          self.version,
          package_root.display()
        )
      })
      .await
      .map(|compiler| compiler.clone())
  }
}

#[derive(Debug)]
struct SvelteCompiler {
  entry: PathBuf,
}

impl SvelteCompiler {
  async fn compile(
    &self,
    source: &str,
    options: &CompileOptions,
  ) -> Result<String, AnyError> {
    let input = serde_json::json!({
      "entry": self.entry,
      "source": source,
      "options": options,
    });
    let mut child = tokio::process::Command::new("node")
      .args(["--input-type=module", "-e", SVELTE_RUNNER_JS])
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .context("failed to spawn node for the component compiler")?;
    child
      .stdin
      .take()
      .unwrap()
      .write_all(&serde_json::to_vec(&input)?)
      .await?;
    let output = child.wait_with_output().await?;
    if !output.status.success() {
      bail!(
        "compiler runner exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      );
    }
    let output: RunnerOutput = serde_json::from_slice(&output.stdout)
      .context("malformed compiler runner output")?;
    match (output.code, output.error) {
      (Some(code), _) => Ok(code),
      (None, Some(error)) => bail!("compile failed: {error}"),
      (None, None) => bail!("compiler runner produced neither code nor error"),
    }
  }
}

/// Exact compiler version → lazy compile thunk. Populated once at process
/// start from the generated manifest; versions outside the table are
/// compile errors, which the orchestrator degrades to pass-through.
#[derive(Debug)]
pub struct CompilerRegistry {
  entries: HashMap<String, CompilerEntry>,
}

impl CompilerRegistry {
  pub fn new() -> Self {
    let manifest: CompilersManifest =
      serde_json::from_str(COMPILERS_MANIFEST_JSON)
        .expect("bundled compiler manifest is valid");
    let entries = manifest
      .svelte
      .into_iter()
      .map(|entry| {
        (
          entry.version.clone(),
          CompilerEntry {
            version: entry.version,
            entry_subpaths: entry.entries,
            loaded: OnceCell::new(),
          },
        )
      })
      .collect();
    Self { entries }
  }

  pub fn has_version(&self, version: &str) -> bool {
    self.entries.contains_key(version)
  }

  pub async fn compile(
    &self,
    installer: &Installer,
    version: &str,
    source: &str,
    options: &CompileOptions,
  ) -> Result<String, AnyError> {
    let Some(entry) = self.entries.get(version) else {
      bail!("svelte@{version} is not in the compiler registry");
    };
    let compiler = entry.load(installer).await?;
    compiler.compile(source, options).await
  }
}

impl Default for CompilerRegistry {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bundled_manifest_parses_and_spans_the_supported_majors() {
    let registry = CompilerRegistry::new();
    assert!(registry.has_version("3.59.2"));
    assert!(registry.has_version("4.2.19"));
    assert!(registry.has_version("5.16.0"));
    assert!(!registry.has_version("2.0.0"));
  }

  #[tokio::test]
  async fn unknown_versions_are_compile_errors() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Installer::new(
      dir.path().to_path_buf(),
      Arc::new(crate::installer::NpmCli),
    );
    let registry = CompilerRegistry::new();
    let err = registry
      .compile(
        &installer,
        "2.0.0",
        "<h1>hi</h1>",
        &CompileOptions {
          name: "App".to_string(),
          filename: "App.svelte".to_string(),
          dev: false,
        },
      )
      .await
      .unwrap_err();
    assert!(err.to_string().contains("not in the compiler registry"));
  }

  #[test]
  fn options_serialize_to_exactly_the_recognized_keys() {
    let options = CompileOptions {
      name: "App".to_string(),
      filename: "App.svelte".to_string(),
      dev: false,
    };
    assert_eq!(
      serde_json::to_value(&options).unwrap(),
      serde_json::json!({
        "name": "App",
        "filename": "App.svelte",
        "dev": false,
      })
    );
  }
}
