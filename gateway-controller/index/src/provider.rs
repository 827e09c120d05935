use arc_swap::ArcSwap;
use gateway_controller_core::{ChangeToken, ChangeTrigger, RouteSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;

pub type SharedProvider = Arc<ConfigProvider>;

/// Holds the current [`RouteSnapshot`].
///
/// Readers load the current snapshot without blocking and keep whatever they loaded for as long
/// as they need it. Publication builds the replacement's change token, swaps the reference, and
/// only then fires the previous snapshot's token, so that a waiter that wakes always observes the
/// newer snapshot.
#[derive(Debug)]
pub struct ConfigProvider {
    current: ArcSwap<RouteSnapshot>,

    /// Serializes publishers and owns the trigger for the current snapshot's token.
    writer: Mutex<Writer>,
}

#[derive(Debug)]
struct Writer {
    version: u64,
    trigger: ChangeTrigger,
}

// === impl ConfigProvider ===

impl Default for ConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider {
    /// Starts with an empty, version-0 snapshot whose token fires on the first publish.
    pub fn new() -> Self {
        let (trigger, change_token) = ChangeToken::pair();
        let initial = RouteSnapshot {
            change_token,
            ..Default::default()
        };
        Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(Writer {
                version: 0,
                trigger,
            }),
        }
    }

    pub fn shared() -> SharedProvider {
        Arc::new(Self::new())
    }

    /// Makes `snapshot` current, returning the version it was assigned.
    pub fn publish(&self, mut snapshot: RouteSnapshot) -> u64 {
        debug_assert!(snapshot.is_consistent(), "snapshot routes must refer to its clusters");

        let mut writer = self.writer.lock();
        let (trigger, change_token) = ChangeToken::pair();
        writer.version += 1;
        snapshot.version = writer.version;
        snapshot.change_token = change_token;

        self.current.store(Arc::new(snapshot));
        let previous = std::mem::replace(&mut writer.trigger, trigger);
        previous.fire();

        tracing::debug!(version = writer.version, "Published snapshot");
        writer.version
    }

    pub fn get_config(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Returns a token that fires once a snapshot newer than `snapshot` is current.
    ///
    /// If `snapshot` has already been superseded, the returned token has already fired.
    pub fn changed(&self, snapshot: &RouteSnapshot) -> ChangeToken {
        let current = self.current.load();
        if current.version == snapshot.version {
            return current.change_token.clone();
        }
        let (trigger, token) = ChangeToken::pair();
        trigger.fire();
        token
    }
}
