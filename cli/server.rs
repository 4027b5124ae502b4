// Copyright 2025 the modcdn authors. MIT license.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header;
use http::Request;
use http::Response;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::errors::http_status;
use crate::errors::AnyError;
use crate::proc_state::ProcState;
use crate::proc_state::RequestKind;
use crate::proc_state::ServeOutcome;

const PREFETCH_WORKERS: usize = 4;

/// Accept loop plus the prefetch worker pool. Runs until the listener
/// errors out.
pub async fn serve(
  state: ProcState,
  listener: TcpListener,
  prefetch_rx: mpsc::Receiver<String>,
) -> Result<(), AnyError> {
  tokio::spawn(prefetch_worker_loop(state.clone(), prefetch_rx));

  loop {
    let (stream, _) = listener.accept().await?;
    let io = TokioIo::new(stream);
    let state = state.clone();
    tokio::spawn(async move {
      let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_request(state, req).await }
      });
      if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
      {
        log::debug!("connection error: {:?}", err);
      }
    });
  }
}

/// Discovered edges arrive over the bounded queue; a small pool builds
/// them concurrently. Everything here is best-effort.
async fn prefetch_worker_loop(
  state: ProcState,
  mut prefetch_rx: mpsc::Receiver<String>,
) {
  let workers = Arc::new(Semaphore::new(PREFETCH_WORKERS));
  while let Some(url) = prefetch_rx.recv().await {
    let permit = workers.clone().acquire_owned().await.unwrap();
    let state = state.clone();
    tokio::spawn(async move {
      let _permit = permit;
      state.prefetch(&url).await;
    });
  }
}

async fn handle_request(
  state: ProcState,
  req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, http::Error> {
  let url = req
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());

  if url == "/" {
    return Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_TYPE, "text/plain")
      .body(Full::new(Bytes::from_static(b"Hello")));
  }
  if url == "/favicon.ico" {
    return Response::builder()
      .status(StatusCode::NO_CONTENT)
      .body(Full::default());
  }

  match state.serve_module(&url, RequestKind::User).await {
    Ok(ServeOutcome::Redirect(location)) => Response::builder()
      .status(StatusCode::TEMPORARY_REDIRECT)
      .header(header::LOCATION, encode_location(&location))
      .body(Full::default()),
    Ok(ServeOutcome::Body {
      bytes,
      content_type,
    }) => match gzip(&bytes) {
      Ok(compressed) => Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_ENCODING, "gzip")
        .body(Full::new(Bytes::from(compressed))),
      Err(err) => {
        log::error!("gzip failed for {}: {:#}", url, err);
        Response::builder()
          .status(StatusCode::INTERNAL_SERVER_ERROR)
          .body(Full::default())
      }
    },
    Ok(ServeOutcome::Skipped) => Response::builder()
      .status(StatusCode::NO_CONTENT)
      .body(Full::default()),
    Err(err) => {
      let status = http_status(&err);
      if status >= 500 {
        log::error!("request {} failed: {:#}", url, err);
      } else {
        log::debug!("request {} rejected: {:#}", url, err);
      }
      Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(format!("{err:#}"))))
    }
  }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = GzEncoder::new(
    Vec::with_capacity(data.len() / 2),
    Compression::default(),
  );
  encoder.write_all(data)?;
  encoder.finish()
}

/// Canonical URLs may hold characters a header value cannot (data URL
/// subpaths have spaces); escape just enough to stay a valid target.
fn encode_location(location: &str) -> String {
  const LOCATION_SET: percent_encoding::AsciiSet = percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');
  percent_encoding::utf8_percent_encode(location, &LOCATION_SET).to_string()
}
