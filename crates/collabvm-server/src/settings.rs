//! Server-wide configuration with copy-on-update snapshots.

use std::sync::Arc;

use collabvm_proto::{ServerSettingUpdate, ServerSettings};

/// Holds the current [`ServerSettings`] snapshot. Updates build a new
/// snapshot by copying the current one and applying each modification, so
/// readers holding an earlier `Arc` keep a consistent view.
pub struct SettingsStore {
    current: Arc<ServerSettings>,
}

impl SettingsStore {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            current: Arc::new(settings),
        }
    }

    pub fn snapshot(&self) -> Arc<ServerSettings> {
        Arc::clone(&self.current)
    }

    /// Apply `updates` element-wise and swap in the result. Returns
    /// `(new, old)` so the caller can persist the new snapshot and
    /// reconfigure subsystems that depend on the changed values.
    pub fn update(
        &mut self,
        updates: &[ServerSettingUpdate],
    ) -> (Arc<ServerSettings>, Arc<ServerSettings>) {
        let mut next = (*self.current).clone();
        for update in updates {
            next.apply(update);
        }
        let old = std::mem::replace(&mut self.current, Arc::new(next));
        (Arc::clone(&self.current), old)
    }
}
