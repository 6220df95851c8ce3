//! Runner binary: loads config, assembles the decision core, and serves the control API.

mod bootstrap;
mod config_loader;
mod control_api;
mod pdca;
mod runtime;
mod state;

use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::Result;
use futures::FutureExt;
use tokio::task::JoinHandle;

/// Spawns a background task whose panic is logged instead of vanishing with the handle.
pub(crate) fn spawn_detached<F>(name: &'static str, critical: bool, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            if critical {
                tracing::error!(task = name, "critical background task panicked");
            } else {
                tracing::warn!(task = name, "background task panicked");
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::async_main().await
}
