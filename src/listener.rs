// MIT License - Copyright (c) 2021 TJForc
// Status listeners notified by the panel

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::constants::ObjectClass;
use crate::panel::AtsPanel;

/// Handle returned by [`ListenerRegistry::register`].
pub type ListenerId = u64;

/// Something that follows the panel: a zone, an area, or any other observer.
#[async_trait]
pub trait PanelStatusListener: Send + Sync {
    /// All bring-up gates are satisfied.
    async fn on_bridge_connected(&self, _panel: &AtsPanel) {}

    /// The connection was torn down.
    async fn on_bridge_disconnected(&self, _panel: &AtsPanel) {}

    /// The panel object this listener mirrors, used to route change-of-state
    /// bits. `None` for observers that do not mirror an object.
    fn object(&self) -> Option<(ObjectClass, u32)> {
        None
    }

    /// The panel reported a change for [`PanelStatusListener::object`].
    async fn on_changed_status(&self, _panel: &AtsPanel) {}
}

/// Registered listeners in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Arc<dyn PanelStatusListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn PanelStatusListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Returns whether a listener was removed.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Copy of the current list, so callbacks run without the lock held.
    pub fn snapshot(&self) -> Vec<Arc<dyn PanelStatusListener>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Listeners mirroring `class` object `index`.
    pub fn tracking(&self, class: ObjectClass, index: u32) -> Vec<Arc<dyn PanelStatusListener>> {
        self.snapshot()
            .into_iter()
            .filter(|l| l.object() == Some((class, index)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tracker(Option<(ObjectClass, u32)>);

    #[async_trait]
    impl PanelStatusListener for Tracker {
        fn object(&self) -> Option<(ObjectClass, u32)> {
            self.0
        }
    }

    #[test]
    fn test_register_unregister() {
        let registry = ListenerRegistry::new();
        let a = registry.register(Arc::new(Tracker(Some((ObjectClass::Zone, 3)))));
        let b = registry.register(Arc::new(Tracker(None)));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tracking_by_object() {
        let registry = ListenerRegistry::new();
        registry.register(Arc::new(Tracker(Some((ObjectClass::Zone, 3)))));
        registry.register(Arc::new(Tracker(Some((ObjectClass::Area, 3)))));
        registry.register(Arc::new(Tracker(Some((ObjectClass::Zone, 7)))));
        registry.register(Arc::new(Tracker(None)));

        assert_eq!(registry.tracking(ObjectClass::Zone, 3).len(), 1);
        assert_eq!(registry.tracking(ObjectClass::Area, 3).len(), 1);
        assert!(registry.tracking(ObjectClass::Area, 7).is_empty());
        assert_eq!(registry.snapshot().len(), 4);
    }
}
