use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::capability::Capability;
use crate::local::{LocalClient, Server};

/// Remembers which server objects were handed out as capabilities, so a
/// capability that comes back can be unwrapped to the concrete server.
///
/// Lookups never touch the network when the capability is already local.
pub struct CapabilityServerSet<S: Server> {
    servers: Mutex<HashMap<usize, Weak<S>>>,
}

impl<S: Server> CapabilityServerSet<S> {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, server: S) -> Capability {
        self.add_arc(Arc::new(server))
    }

    pub fn add_arc(&self, server: Arc<S>) -> Capability {
        let ptr = Arc::as_ptr(&server) as *const () as usize;
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers.retain(|_, weak| weak.strong_count() > 0);
        servers.insert(ptr, Arc::downgrade(&server));
        Capability::from_arc(server)
    }

    /// Wait for `cap` to resolve, then return its server if it belongs to this set.
    ///
    /// If a streaming call is in flight on the capability, waits until calls
    /// made before this lookup have been delivered.
    pub async fn get_local_server(&self, cap: &Capability) -> Option<Arc<S>> {
        // A broken resolution simply isn't one of ours.
        let _ = cap.when_resolved().await;
        let resolved = cap.resolved();
        let ptr = resolved.hook().server_ptr()?;
        let server = {
            let servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
            servers.get(&ptr).and_then(Weak::upgrade)?
        };
        if let Some(local) = resolved.hook().as_any().downcast_ref::<LocalClient>() {
            local.idle().await;
        }
        Some(server)
    }
}

impl<S: Server> Default for CapabilityServerSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Server> fmt::Debug for CapabilityServerSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .servers
            .lock()
            .map(|servers| servers.len())
            .unwrap_or_default();
        f.debug_struct("CapabilityServerSet").field("servers", &len).finish()
    }
}
