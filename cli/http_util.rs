// Copyright 2025 the modcdn authors. MIT license.

use url::Url;

use crate::errors::bail;
use crate::errors::AnyError;
use crate::version;

#[derive(Debug, Clone)]
pub struct HttpClient(reqwest::Client);

impl HttpClient {
  pub fn new() -> Result<Self, AnyError> {
    Ok(Self(
      reqwest::Client::builder()
        .user_agent(version::user_agent())
        .build()?,
    ))
  }

  /// Downloads a URL. `Ok(None)` on a 404, an error for any other
  /// non-success status.
  pub async fn download_maybe(
    &self,
    url: Url,
  ) -> Result<Option<Vec<u8>>, AnyError> {
    let response = self.0.get(url.clone()).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      bail!("bad response for '{}': {}", url, response.status());
    }
    Ok(Some(response.bytes().await?.to_vec()))
  }

  pub async fn download(&self, url: Url) -> Result<Vec<u8>, AnyError> {
    match self.download_maybe(url.clone()).await? {
      Some(bytes) => Ok(bytes),
      None => bail!("not found: '{}'", url),
    }
  }
}
