//
// cancel.rs
//
// Per-request cancellation scopes keyed by JSON-RPC request id
//

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc::Id;

/// Error returned by work that observed its scope being cancelled.
///
/// Handlers propagate it with `?`; the dispatcher recognises it (also inside
/// an `anyhow::Error`) and answers with `RequestCancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request cancelled")]
pub struct Cancelled;

#[derive(Debug)]
struct Registration {
    generation: u64,
    token: CancellationToken,
}

/// In-flight requests that a `$/cancelRequest` can still reach
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    inflight: Mutex<HashMap<Id, Registration>>,
    next_generation: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<Id, Registration>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id` and returns its scope. The registration is removed when
    /// the scope is dropped.
    pub fn register(self: &Arc<Self>, id: Id) -> RequestScope {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let replaced = self.inflight().insert(
            id.clone(),
            Registration {
                generation,
                token: token.clone(),
            },
        );
        if replaced.is_some() {
            log::warn!("Request id {} reused while still in flight", id);
        }
        RequestScope {
            id: Some(id),
            generation,
            token,
            registry: Some(self.clone()),
        }
    }

    /// Triggers cancellation of `id`. Returns false (and does nothing) when
    /// the id is not in flight.
    pub fn cancel(&self, id: &Id) -> bool {
        match self.inflight().remove(id) {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels everything still in flight.
    pub fn cancel_all(&self) {
        for (_, registration) in self.inflight().drain() {
            registration.token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inflight().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight().is_empty()
    }

    fn deregister(&self, id: &Id, generation: u64) {
        let mut inflight = self.inflight();
        if inflight.get(id).map(|r| r.generation) == Some(generation) {
            inflight.remove(id);
        }
    }
}

/// Cancellable execution scope of one request.
///
/// Deregisters itself from its registry on drop, whether the work finished,
/// failed, or was cancelled.
#[derive(Debug)]
pub struct RequestScope {
    id: Option<Id>,
    generation: u64,
    token: CancellationToken,
    registry: Option<Arc<CancellationRegistry>>,
}

impl RequestScope {
    /// A scope that is not registered anywhere (notifications, internal work).
    pub fn detached() -> Self {
        Self {
            id: None,
            generation: 0,
            token: CancellationToken::new(),
            registry: None,
        }
    }

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if let (Some(registry), Some(id)) = (&self.registry, &self.id) {
            registry.deregister(id, self.generation);
        }
    }
}
