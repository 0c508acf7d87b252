use anyhow::{Context, Result};
use facematch_gallery::{EmbeddingGallery, FileStore};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod protocol;

use protocol::{error_response, Request};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("facematchd starting");

    let config = config::Config::load().context("invalid configuration")?;

    let mut store = FileStore::new(&config.gallery_path);
    if let Some(bundled) = &config.bundled_gallery {
        store = store.with_bundled(bundled);
    }

    // Blocking I/O stays off the async workers.
    let load_store = store.clone();
    let gallery = tokio::task::spawn_blocking(move || EmbeddingGallery::load(Arc::new(load_store)))
        .await?
        .with_context(|| format!("failed to load gallery from {}", config.gallery_path.display()))?;

    let text_dump = config.text_dump.then(|| store.clone());
    let handle = engine::spawn_engine(config.matcher.clone(), gallery, config.persist_policy, text_dump)?;

    tracing::info!(gallery = %config.gallery_path.display(), "facematchd ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match Request::parse(&line) {
            // Matches run detached so a burst of frames exercises the drop policy
            // instead of queueing behind the reader.
            Ok(request @ Request::Match { .. }) => {
                let handle = handle.clone();
                in_flight.spawn(async move {
                    emit(&protocol::respond(&handle, request).await);
                });
                // Reap finished matches so the set stays small.
                while in_flight.try_join_next().is_some() {}
            }
            Ok(request) => emit(&protocol::respond(&handle, request).await),
            Err(e) => {
                tracing::warn!(error = %e, "malformed request");
                emit(&error_response("error", e));
            }
        }
    }

    tracing::info!(in_flight = in_flight.len(), "facematchd shutting down");
    protocol::shutdown(&handle, &mut in_flight)
        .await
        .context("final persist failed")?;
    Ok(())
}

fn emit(response: &serde_json::Value) {
    println!("{response}");
}
