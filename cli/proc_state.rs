// Copyright 2025 the modcdn authors. MIT license.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use deno_ast::MediaType;
use deno_ast::ModuleSpecifier;
use deno_semver::Version;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use modcdn_resolver::resolve_package_subpath;
use modcdn_resolver::PackageJson;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::ast;
use crate::cache::ModuleCache;
use crate::compilers::CompileOptions;
use crate::compilers::CompilerRegistry;
use crate::errors::anyhow;
use crate::errors::AnyError;
use crate::errors::CdnError;
use crate::errors::Context;
use crate::flags::Flags;
use crate::http_util::HttpClient;
use crate::installer::Installer;
use crate::installer::NpmClient;
use crate::installer::NpmCli;
use crate::registry::RegistryClient;
use crate::urls;
use crate::urls::ParsedRequest;
use crate::urls::Registry;

const MODULE_CACHE_DB_NAME: &str = "module_cache_v1.db";
const PREFETCH_QUEUE_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  User,
  /// A speculative follow-up spawned by the rewriter. Collisions with an
  /// in-flight build bail out instead of waiting.
  Prefetch,
}

#[derive(Debug)]
pub enum ServeOutcome {
  Redirect(String),
  Body {
    bytes: Arc<Vec<u8>>,
    content_type: &'static str,
  },
  /// A colliding speculative prefetch; the HTTP layer answers 204.
  Skipped,
}

/// The resolved description of one request: exact version, concrete
/// subpath, recognized flags, and where the installed package lives.
#[derive(Debug, Clone)]
pub struct RequestConfig {
  pub registry: Registry,
  pub name: String,
  pub version: String,
  pub subpath: String,
  pub flags: BTreeMap<String, String>,
  pub query: Vec<(String, String)>,
  pub original_url: String,
  pub manifest: PackageJson,
  pub install_dir: PathBuf,
}

impl RequestConfig {
  pub fn canonical_url(&self) -> String {
    urls::encode(
      self.registry,
      &self.name,
      &self.version,
      &self.subpath,
      &self.flags,
      &self.query,
    )
  }

  fn metadata_requested(&self) -> bool {
    metadata_requested(&self.flags)
  }
}

fn metadata_requested(flags: &BTreeMap<String, String>) -> bool {
  flags
    .get("metadata")
    .map(|value| urls::flag_value_is_truthy(value))
    .unwrap_or(false)
}

fn content_type_for(flags: &BTreeMap<String, String>) -> &'static str {
  if metadata_requested(flags) {
    "application/json"
  } else {
    "application/javascript"
  }
}

type BuildResult = Result<Arc<Vec<u8>>, Arc<AnyError>>;
type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

/// Process-wide singletons with one-shot init: the cache handle, the
/// installer's single-flight map, the compiler registry and the in-flight
/// build set all live here and are passed through the orchestrator
/// instead of sitting in ambient globals.
#[derive(Clone)]
pub struct ProcState(Arc<Inner>);

pub struct Inner {
  pub flags: Flags,
  pub registry: RegistryClient,
  pub installer: Installer,
  pub cache: ModuleCache,
  pub compilers: CompilerRegistry,
  inflight: Mutex<HashMap<String, SharedBuild>>,
  prefetch_tx: mpsc::Sender<String>,
}

impl Deref for ProcState {
  type Target = Inner;
  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl ProcState {
  pub fn build(
    flags: Flags,
  ) -> Result<(Self, mpsc::Receiver<String>), AnyError> {
    Self::build_with_npm_client(flags, Arc::new(NpmCli))
  }

  /// Tests inject their own package manager here.
  pub fn build_with_npm_client(
    flags: Flags,
    npm_client: Arc<dyn NpmClient>,
  ) -> Result<(Self, mpsc::Receiver<String>), AnyError> {
    let packages_root = flags.dir.join("packages");
    std::fs::create_dir_all(&packages_root)
      .with_context(|| format!("failed creating '{}'", flags.dir.display()))?;
    let cache = ModuleCache::from_path(
      &flags.dir.join(MODULE_CACHE_DB_NAME),
      crate::version::CDN_BUILD,
    )?;
    let http_client = HttpClient::new()?;
    let registry = RegistryClient::new(&flags.registry_url, http_client)?;
    let installer = Installer::new(packages_root, npm_client);
    let (prefetch_tx, prefetch_rx) = mpsc::channel(PREFETCH_QUEUE_DEPTH);
    let state = Self(Arc::new(Inner {
      flags,
      registry,
      installer,
      cache,
      compilers: CompilerRegistry::new(),
      inflight: Mutex::new(HashMap::new()),
      prefetch_tx,
    }));
    Ok((state, prefetch_rx))
  }

  /// The whole pipeline for one URL: decode, canonicalize, redirect or
  /// serve from cache, otherwise build.
  pub async fn serve_module(
    &self,
    raw_url: &str,
    kind: RequestKind,
  ) -> Result<ServeOutcome, AnyError> {
    let parsed = urls::decode(raw_url)?;
    // Compare against the percent-decoded wire form so that an encoded
    // spelling of a canonical URL serves instead of redirecting to
    // itself forever.
    let normalized_url = {
      let (path, query) = match raw_url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw_url, None),
      };
      let mut normalized = percent_encoding::percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| CdnError::InvalidUrl(raw_url.to_string()))?
        .into_owned();
      if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(query);
      }
      normalized
    };

    if parsed.canonical {
      let rendered = urls::encode(
        parsed.registry,
        &parsed.name,
        parsed.version.as_deref().unwrap_or_default(),
        &parsed.subpath,
        &parsed.flags,
        &parsed.query,
      );
      if rendered == normalized_url {
        // Already canonical: nothing to re-resolve. The happy path is a
        // straight cache read.
        if let Some(bytes) = self.cache.get(&rendered) {
          return Ok(ServeOutcome::Body {
            bytes: Arc::new(bytes),
            content_type: content_type_for(&parsed.flags),
          });
        }
        let config = self.resolve_request(parsed, raw_url).await?;
        return self.build_coalesced(config, rendered, kind).await;
      }
      // Canonical grammar but not this engine's rendering (stale build,
      // unsorted flags). The exact version and concrete subpath still
      // hold, so the re-rendered form is the redirect target.
      if kind == RequestKind::User {
        return Ok(ServeOutcome::Redirect(rendered));
      }
      let config = self.resolve_request(parsed, raw_url).await?;
      return self.build_coalesced(config, rendered, kind).await;
    }

    let config = self.resolve_request(parsed, raw_url).await?;
    let canonical = config.canonical_url();
    if kind == RequestKind::User {
      return Ok(ServeOutcome::Redirect(canonical));
    }
    self.build_coalesced(config, canonical, kind).await
  }

  /// Background worker entry for one discovered edge.
  pub async fn prefetch(&self, url: &str) {
    if let Err(err) = self.serve_module(url, RequestKind::Prefetch).await {
      log::debug!("prefetch of {} failed: {:#}", url, err);
    }
  }

  /// Turns a decoded request into a `RequestConfig`: resolves the version
  /// and the svelte flag to exact versions, installs the package, loads
  /// its manifest and (for raw requests) resolves the subpath.
  async fn resolve_request(
    &self,
    parsed: ParsedRequest,
    original_url: &str,
  ) -> Result<RequestConfig, AnyError> {
    let version = match (parsed.registry, parsed.canonical) {
      (_, true) => parsed.version.clone().unwrap(),
      (Registry::Npm, false) => {
        let range = parsed.version.as_deref().unwrap_or("latest");
        self.registry.resolve_version(&parsed.name, range).await?
      }
      // github refs have no registry protocol to resolve against
      (Registry::Github, false) => {
        parsed.version.clone().unwrap_or_else(|| "latest".to_string())
      }
    };

    let mut flags = parsed.flags.clone();
    if let Some(compiler_range) = flags.get("svelte") {
      if Version::parse_from_npm(compiler_range).is_err() {
        let exact = self
          .registry
          .resolve_version("svelte", compiler_range)
          .await?;
        flags.insert("svelte".to_string(), exact);
      }
    }

    let install_dir = self
      .installer
      .ensure_installed(parsed.registry, &parsed.name, &version)
      .await?;
    let package_root = self.installer.package_root(&parsed.name, &version);
    let manifest = PackageJson::load(&package_root.join("package.json"))
      .with_context(|| {
        format!("installed manifest missing for {}@{}", parsed.name, version)
      })?;

    let subpath = if parsed.canonical {
      parsed.subpath
    } else {
      resolve_package_subpath(&manifest, &parsed.subpath, &package_root)
    };

    Ok(RequestConfig {
      registry: parsed.registry,
      name: parsed.name,
      version,
      subpath,
      flags,
      query: parsed.query,
      original_url: original_url.to_string(),
      manifest,
      install_dir,
    })
  }

  /// At most one build per canonical URL: late arrivals wait on the
  /// original worker's shared future, except speculative prefetches,
  /// which return immediately.
  async fn build_coalesced(
    &self,
    config: RequestConfig,
    canonical: String,
    kind: RequestKind,
  ) -> Result<ServeOutcome, AnyError> {
    if let Some(bytes) = self.cache.get(&canonical) {
      return Ok(ServeOutcome::Body {
        bytes: Arc::new(bytes),
        content_type: content_type_for(&config.flags),
      });
    }

    let content_type = content_type_for(&config.flags);
    let future = {
      let mut inflight = self.inflight.lock();
      match inflight.get(&canonical) {
        Some(future) => {
          if kind == RequestKind::Prefetch {
            return Ok(ServeOutcome::Skipped);
          }
          future.clone()
        }
        None => {
          let state = self.clone();
          let config = config.clone();
          let key = canonical.clone();
          // The build runs in its own task so that a client disconnect
          // never abandons an install or compile midway; the task drops
          // its own in-flight entry when it finishes.
          let handle = tokio::spawn(async move {
            let result = state
              .build_module(config, key.clone())
              .await
              .map(Arc::new)
              .map_err(Arc::new);
            state.inflight.lock().remove(&key);
            result
          });
          let future = async move {
            match handle.await {
              Ok(result) => result,
              Err(err) => Err(Arc::new(anyhow!("module build died: {err}"))),
            }
          }
          .boxed()
          .shared();
          inflight.insert(canonical.clone(), future.clone());
          future
        }
      }
    };
    match future.await {
      Ok(bytes) => Ok(ServeOutcome::Body {
        bytes,
        content_type,
      }),
      Err(err) => Err(reclassify_shared_error(&err)),
    }
  }

  /// install → read → compile → rewrite → store. Transform failures
  /// degrade to pass-through; only identity failures error out.
  async fn build_module(
    &self,
    config: RequestConfig,
    canonical: String,
  ) -> Result<Vec<u8>, AnyError> {
    // An inlined empty module: the manifest mapped this entry to `false`,
    // and the artifact is the data URL itself.
    if config.subpath.starts_with("data:") {
      let body = config.subpath.clone().into_bytes();
      self.cache.set(&canonical, &body);
      return Ok(body);
    }

    let package_root = self
      .installer
      .package_root(&config.name, &config.version);
    let file_path = package_root.join(config.subpath.trim_start_matches("./"));
    let bytes = tokio::fs::read(&file_path)
      .await
      .map_err(|_| CdnError::FileNotFound(config.subpath.clone()))?;

    let source = match String::from_utf8(bytes) {
      Ok(source) => source,
      Err(err) => {
        // not module text; serve the bytes untouched
        let body = err.into_bytes();
        self.cache.set(&canonical, &body);
        return Ok(body);
      }
    };

    let mut source = source;
    let mut compiled = false;
    if config.subpath.ends_with(".svelte") {
      if let Some(compiler_version) = config.flags.get("svelte") {
        let options = CompileOptions {
          name: component_name(&config.subpath),
          filename: config.subpath.trim_start_matches("./").to_string(),
          dev: false,
        };
        match self
          .compilers
          .compile(&self.installer, compiler_version, &source, &options)
          .await
        {
          Ok(code) => {
            source = code;
            compiled = true;
          }
          Err(err) => {
            // never fail the request over a compile error
            log::warn!("compile failed for {}: {:#}", canonical, err);
          }
        }
      }
    }

    let (code, edges) = self.rewrite_module(&config, source, compiled).await;

    let body = if config.metadata_requested() {
      serde_json::to_vec(&serde_json::json!({
        "url": canonical,
        "code": code,
        "imports": edges,
      }))?
    } else {
      code.into_bytes()
    };
    self.cache.set(&canonical, &body);

    for edge in edges {
      if let Err(err) = self.prefetch_tx.try_send(edge) {
        log::debug!("prefetch queue full, dropping edge: {}", err);
      }
    }
    Ok(body)
  }

  /// Patches every resolvable specifier to its canonical URL and returns
  /// the rewritten source plus the canonical edges found. Declaration
  /// files and non-module media are passed through.
  async fn rewrite_module(
    &self,
    config: &RequestConfig,
    source: String,
    compiled: bool,
  ) -> (String, Vec<String>) {
    if config.subpath.ends_with(".d.ts") {
      return (source, Vec::new());
    }
    let media_type = if compiled {
      MediaType::JavaScript
    } else {
      match media_type_for_subpath(&config.subpath) {
        Some(media_type) => media_type,
        None => return (source, Vec::new()),
      }
    };

    let parse_specifier = module_specifier_for(config);
    let collected =
      match ast::collect_specifiers(&parse_specifier, &source, media_type) {
        Ok(collected) => collected,
        Err(err) => {
          log::debug!(
            "not rewriting {}; parse failed: {:#}",
            config.original_url,
            err
          );
          return (source, Vec::new());
        }
      };

    let mut changes = Vec::new();
    let mut edges = Vec::new();
    for (specifier, ranges) in &collected {
      match self.resolve_specifier(config, specifier).await {
        Ok(resolved) => {
          for range in ranges {
            changes.push(ast::TextChange {
              range: range.clone(),
              new_text: format!("\"{resolved}\""),
            });
          }
          edges.push(resolved);
        }
        Err(err) => {
          log::debug!(
            "leaving '{}' untouched in {}: {:#}",
            specifier,
            config.original_url,
            err
          );
        }
      }
    }
    (ast::apply_text_changes(&source, changes), edges)
  }

  /// One import edge: relative specifiers resolve against the request's
  /// own URL, bare specifiers through the manifest's dependency maps,
  /// and both come back as canonical URLs after running the pipeline.
  async fn resolve_specifier(
    &self,
    config: &RequestConfig,
    specifier: &str,
  ) -> Result<String, AnyError> {
    let parsed = if specifier.starts_with('.') {
      let base_path = format!(
        "/{}/{}@{}/{}",
        config.registry,
        config.name,
        config.version,
        config.subpath.trim_start_matches("./"),
      );
      let base = Url::parse("http://modcdn.internal")?.join(&base_path)?;
      let joined = base.join(specifier)?;
      let mut raw = joined.path().to_string();
      if let Some(compiler_version) = config.flags.get("svelte") {
        raw.push_str(&format!("?svelte={compiler_version}"));
      }
      urls::decode(&raw)?
    } else {
      let (name, subpath) = split_bare_specifier(specifier);
      let version = if name == "svelte" && config.flags.contains_key("svelte")
      {
        config.flags.get("svelte").unwrap().clone()
      } else {
        config
          .manifest
          .dependency_version(&name)
          .unwrap_or("latest")
          .to_string()
      };
      let mut flags = BTreeMap::new();
      if let Some(compiler_version) = config.flags.get("svelte") {
        flags.insert("svelte".to_string(), compiler_version.clone());
      }
      ParsedRequest {
        registry: Registry::Npm,
        name,
        version: Some(version),
        subpath,
        flags,
        query: Vec::new(),
        canonical: false,
      }
    };

    let edge_config = self.resolve_request(parsed, specifier).await?;
    Ok(edge_config.canonical_url())
  }
}

/// `@scope/name/deep/file.js` → (`@scope/name`, `./deep/file.js`)
fn split_bare_specifier(specifier: &str) -> (String, String) {
  let segment_count = if specifier.starts_with('@') { 2 } else { 1 };
  let mut segments = specifier.splitn(segment_count + 1, '/');
  let mut name = String::new();
  for _ in 0..segment_count {
    if let Some(segment) = segments.next() {
      if !name.is_empty() {
        name.push('/');
      }
      name.push_str(segment);
    }
  }
  let rest = segments.next().unwrap_or("");
  let subpath = if rest.is_empty() {
    ".".to_string()
  } else {
    format!("./{rest}")
  };
  (name, subpath)
}

/// Component name passed to the compiler: the file stem with anything a
/// JS identifier can't hold replaced.
fn component_name(subpath: &str) -> String {
  let stem = subpath
    .rsplit('/')
    .next()
    .unwrap_or(subpath)
    .trim_end_matches(".svelte");
  let mut name = String::with_capacity(stem.len());
  for (i, c) in stem.chars().enumerate() {
    if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
      if i == 0 && c.is_ascii_digit() {
        name.push('_');
      }
      name.push(c);
    } else {
      name.push('_');
    }
  }
  if name.is_empty() {
    name.push_str("Component");
  }
  name
}

/// Media that goes through the rewriter. `None` is passed through
/// untransformed.
fn media_type_for_subpath(subpath: &str) -> Option<MediaType> {
  let specifier = ModuleSpecifier::parse(&format!(
    "cdn:/{}",
    subpath.trim_start_matches("./")
  ))
  .ok()?;
  match MediaType::from_specifier(&specifier) {
    media_type @ (MediaType::JavaScript
    | MediaType::Jsx
    | MediaType::Mjs
    | MediaType::Cjs
    | MediaType::TypeScript
    | MediaType::Mts
    | MediaType::Cts
    | MediaType::Tsx) => Some(media_type),
    MediaType::Dts | MediaType::Dmts | MediaType::Dcts => None,
    // extensionless files are overwhelmingly plain JS
    MediaType::Unknown => Some(MediaType::JavaScript),
    _ => None,
  }
}

fn module_specifier_for(config: &RequestConfig) -> ModuleSpecifier {
  ModuleSpecifier::parse(&format!(
    "cdn:/{}/{}@{}/{}",
    config.registry,
    config.name,
    config.version,
    config.subpath.trim_start_matches("./"),
  ))
  .unwrap_or_else(|_| ModuleSpecifier::parse("cdn:/module.js").unwrap())
}

/// The shared build future hands out `Arc<AnyError>`; rebuild the typed
/// kind so waiters still map to the right status code.
fn reclassify_shared_error(err: &Arc<AnyError>) -> AnyError {
  match err.downcast_ref::<CdnError>() {
    Some(CdnError::InvalidUrl(url)) => CdnError::InvalidUrl(url.clone()).into(),
    Some(CdnError::VersionUnresolvable { spec, reason }) => {
      CdnError::VersionUnresolvable {
        spec: spec.clone(),
        reason: reason.clone(),
      }
      .into()
    }
    Some(CdnError::InstallFailed { package, reason }) => {
      CdnError::InstallFailed {
        package: package.clone(),
        reason: reason.clone(),
      }
      .into()
    }
    Some(CdnError::FileNotFound(subpath)) => {
      CdnError::FileNotFound(subpath.clone()).into()
    }
    None => anyhow!("{err:#}"),
  }
}
