// Copyright 2025 the modcdn authors. MIT license.

pub mod ast;
pub mod cache;
pub mod compilers;
pub mod errors;
pub mod flags;
pub mod http_util;
pub mod installer;
pub mod proc_state;
pub mod registry;
pub mod server;
pub mod urls;
pub mod version;

use crate::errors::AnyError;
use crate::flags::Flags;
use crate::proc_state::ProcState;

pub fn main() {
  let args: Vec<String> = std::env::args().collect();
  let flags = match flags::flags_from_vec(args) {
    Ok(flags) => flags,
    Err(err) => err.exit(),
  };
  init_logger(flags.log_level);

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
    .expect("failed to build the tokio runtime");
  if let Err(err) = runtime.block_on(run(flags)) {
    log::error!("{:#}", err);
    std::process::exit(1);
  }
}

async fn run(flags: Flags) -> Result<(), AnyError> {
  let port = flags.port;
  let (state, prefetch_rx) = ProcState::build(flags)?;
  let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
  log::info!("modcdn listening on http://{}", listener.local_addr()?);
  server::serve(state, listener, prefetch_rx).await
}

fn init_logger(maybe_level: Option<log::Level>) {
  let mut builder = env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  );
  if let Some(level) = maybe_level {
    builder.filter_level(level.to_level_filter());
  }
  builder.format_timestamp(None);
  builder.init();
}
