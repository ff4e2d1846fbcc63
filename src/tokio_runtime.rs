//! Global Tokio runtime for the session controller and the WebSocket transport
//!
//! GPUI uses its own async executor, but tokio-tungstenite and the controller's
//! timers require a Tokio runtime. This module owns a lazily built global
//! runtime that outlives every window.
//!
//! Inspired by zed-industries/zed gpui_tokio crate.

use gpui::{Context, Task};
use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::{Handle, Runtime};

static TOKIO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Build the global Tokio runtime (once) and return a handle to it
pub fn init() -> std::io::Result<Handle> {
    if let Some(runtime) = TOKIO_RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("parley-tokio")
        .enable_all()
        .build()?;
    let runtime = TOKIO_RUNTIME.get_or_init(|| runtime);
    Ok(runtime.handle().clone())
}

/// Spawn a future on the Tokio runtime and return a GPUI Task
pub fn spawn<T, R, F>(
    cx: &mut Context<T>,
    runtime: &Handle,
    future: F,
) -> Task<Result<R, tokio::task::JoinError>>
where
    R: Send + 'static,
    F: Future<Output = R> + Send + 'static,
{
    let join_handle = runtime.spawn(future);

    cx.foreground_executor().spawn(join_handle)
}
