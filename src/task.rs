// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use tokio::task::JoinHandle;
use tracing::Instrument;

/// A wrapper around [`JoinHandle`] that aborts the task on drop.
///
/// Workers spawned against a bind must not outlive it; tying their lifetime
/// to this handle means replacing or closing the bind reliably reaps them.
pub(crate) struct Task {
    name: &'static str,

    /// INVARIANT: `Some` until the task is stopped or `self` is dropped.
    handle: Option<JoinHandle<()>>,
    span: tracing::Span,
}

impl Task {
    #[track_caller]
    pub(crate) fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Parent is None to avoid nesting spans of the spawning context
        let span = tracing::info_span!(parent: None, "Task", name = name);
        let handle = tokio::spawn(
            async move {
                fut.await;
                tracing::debug!("task exited");
            }
            .instrument(span.clone()),
        );

        Task {
            name,
            handle: Some(handle),
            span,
        }
    }

    /// Abort the task and wait for it to wind down.
    pub(crate) async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            match handle.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(parent: &self.span, "task {} panicked: {e:#?}", self.name);
                }
                _ => {
                    tracing::debug!(parent: &self.span, "stopped task {}", self.name);
                }
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The future is not dropped synchronously by abort; the runtime
            // reaps it later. Prefer `Task::stop` where prompt teardown
            // matters.
            tracing::debug!(parent: &self.span, "dropped task {}", self.name);
            handle.abort();
        }
    }
}
