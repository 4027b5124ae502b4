// Copyright 2025 the modcdn authors. MIT license.

/// Opaque engine revision embedded in every canonical URL as the `cdnv`
/// pair. Bumping it invalidates every cached artifact at once, because no
/// old canonical URL can name a new cache entry.
pub const CDN_BUILD: &str = "pre.1";

pub fn user_agent() -> String {
  format!("modcdn/{} (cdnv {})", env!("CARGO_PKG_VERSION"), CDN_BUILD)
}
