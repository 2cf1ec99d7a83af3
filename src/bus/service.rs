//! Process-wide external bus handle.
//!
//! One outbox and producer per process: the handle is initialised once
//! under a lock and the first configuration wins. Re-initialisation with
//! a different configuration is refused (the existing handle is
//! returned, with a warning). `reset` exists for tests; it closes the
//! producers before releasing the handle.
//!
//! Passing the bus explicitly to the processor builder is preferred;
//! this handle serves code that cannot thread the dependency.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::ExternalBus;

static CURRENT: Mutex<Option<Arc<ExternalBus>>> = Mutex::new(None);

fn lock() -> std::sync::MutexGuard<'static, Option<Arc<ExternalBus>>> {
    CURRENT.lock().unwrap_or_else(|e| e.into_inner())
}

/// Install the process-wide bus. The first call wins; later calls return
/// the already-installed handle and discard their argument.
pub fn init(bus: ExternalBus) -> Arc<ExternalBus> {
    let mut current = lock();
    if let Some(existing) = current.as_ref() {
        warn!("External bus already initialised; keeping the first configuration");
        return existing.clone();
    }
    let handle = Arc::new(bus);
    *current = Some(handle.clone());
    info!("External bus initialised");
    handle
}

/// The installed handle, if any.
pub fn current() -> Option<Arc<ExternalBus>> {
    lock().clone()
}

/// Release the handle and close its producers. For tests.
pub fn reset() {
    let released = lock().take();
    if let Some(bus) = released {
        bus.close();
        info!("External bus reset");
    }
}
