use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug_span, Instrument as _, Span};

/// Spawns a named background task.
///
/// The task runs inside a `task{name=...}` span whose parent is the current span, so anything it logs carries the
/// spawning context along with it.
pub(crate) fn spawn_traced_named<S, F, T>(name: S, f: F) -> JoinHandle<T>
where
    S: Into<String>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    let span = debug_span!(parent: Span::current(), "task", name = %name);
    tokio::task::spawn(f.instrument(span))
}
