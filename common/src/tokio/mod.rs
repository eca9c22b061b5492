//! Tokio runtime re-exports shared by the node crates.
//!
//! Everything from tokio is available under `kestrel_common::tokio`, so the
//! daemon depends on a single pinned runtime surface. Background tasks should
//! be started through [`spawn_task`] so that they carry a name in the logs.

use std::future::Future;

use log::{log_enabled, trace, Level};

pub use ::tokio::*;

/// Spawn a named background task on the current runtime.
pub fn spawn_task<F>(name: impl Into<String>, future: F) -> task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name.into();
    if log_enabled!(Level::Trace) {
        trace!("spawning task {}", name);
    }

    ::tokio::spawn(async move {
        let output = future.await;
        if log_enabled!(Level::Trace) {
            trace!("task {} finished", name);
        }
        output
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[::tokio::test]
    async fn test_spawn_task_returns_output() {
        let handle = spawn_task("answer", async { 42u32 });
        assert_eq!(handle.await.unwrap(), 42);
    }
}
