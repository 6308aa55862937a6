//! Service state and connection registry.
//!
//! One instance is built at startup and shared by the listener and the
//! command handlers. The connection set, the shutdown flag and the tool path
//! sit behind a single mutex.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

/// Opaque handle of a registered peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Shared {
    connections: HashSet<ConnectionId>,
    next_id: u64,
    should_quit: bool,
    tool_path: Option<PathBuf>,
}

/// Process-wide helper state.
#[derive(Debug, Default)]
pub struct ServiceState {
    shared: Mutex<Shared>,
    quit: Condvar,
}

impl ServiceState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register an accepted connection and hand back its id.
    pub fn add(&self) -> ConnectionId {
        let mut shared = self.shared.lock();
        let id = ConnectionId(shared.next_id);
        shared.next_id += 1;
        shared.connections.insert(id);
        debug!(connection = %id, live = shared.connections.len(), "connection added");
        id
    }

    /// Remove a connection. Returns true only for the call that raised the
    /// shutdown flag; later removals leave it set.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut shared = self.shared.lock();
        shared.connections.remove(&id);
        debug!(connection = %id, live = shared.connections.len(), "connection removed");

        if shared.connections.is_empty() && !shared.should_quit {
            shared.should_quit = true;
            self.quit.notify_all();
            info!("no connections left, shutdown requested");
            return true;
        }
        false
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn should_quit(&self) -> bool {
        self.shared.lock().should_quit
    }

    /// Wait at most `interval` for the shutdown flag, then report it.
    pub fn wait_for_quit(&self, interval: Duration) -> bool {
        let mut shared = self.shared.lock();
        if !shared.should_quit {
            self.quit.wait_for(&mut shared, interval);
        }
        shared.should_quit
    }

    // ========================================================================
    // Tool path
    // ========================================================================

    pub fn set_tool_path(&self, path: impl Into<PathBuf>) {
        self.shared.lock().tool_path = Some(path.into());
    }

    pub fn tool_path(&self) -> Option<PathBuf> {
        self.shared.lock().tool_path.clone()
    }
}

/// Registration of one connection. Dropping it is the invalidation hook: the
/// connection leaves the registry, possibly raising the shutdown flag.
#[derive(Debug)]
pub struct Registration {
    state: Arc<ServiceState>,
    id: ConnectionId,
}

impl Registration {
    pub fn new(state: Arc<ServiceState>) -> Self {
        let id = state.add();
        Self { state, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.state.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_fresh_state_not_quitting() {
        let state = ServiceState::new();
        assert!(!state.should_quit());
        assert_eq!(state.connection_count(), 0);
        assert_eq!(state.tool_path(), None);
    }

    #[test]
    fn test_last_removal_sets_flag_once() {
        let state = ServiceState::new();
        let a = state.add();
        let b = state.add();
        assert!(!state.remove(a));
        assert!(!state.should_quit());
        assert!(state.remove(b));
        assert!(state.should_quit());
        assert!(!state.remove(b));
        assert!(state.should_quit());
    }

    #[test]
    fn test_flag_stays_set_after_new_connection() {
        let state = ServiceState::new();
        let a = state.add();
        assert!(state.remove(a));
        let b = state.add();
        assert!(state.should_quit());
        assert!(!state.remove(b));
        assert!(state.should_quit());
    }

    #[test]
    fn test_concurrent_accepts_and_invalidations_flip_once() {
        let state = ServiceState::new();
        // Hold one registration so the set cannot empty until all workers finish.
        let anchor = state.add();
        let flips = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let state = Arc::clone(&state);
                let flips = Arc::clone(&flips);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let id = state.add();
                        if state.remove(id) {
                            flips.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(!state.should_quit());
        assert!(state.remove(anchor));
        assert_eq!(flips.load(Ordering::SeqCst), 0);
        assert!(state.should_quit());
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_unanchored_interleaving_flips_exactly_once() {
        let state = ServiceState::new();
        let flips = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let flips = Arc::clone(&flips);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let id = state.add();
                        if state.remove(id) {
                            flips.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(flips.load(Ordering::SeqCst), 1);
        assert!(state.should_quit());
    }

    #[test]
    fn test_registration_drop_removes() {
        let state = ServiceState::new();
        let reg = Registration::new(Arc::clone(&state));
        assert_eq!(state.connection_count(), 1);
        drop(reg);
        assert_eq!(state.connection_count(), 0);
        assert!(state.should_quit());
    }

    #[test]
    fn test_wait_for_quit_times_out_then_wakes() {
        let state = ServiceState::new();
        let id = state.add();
        assert!(!state.wait_for_quit(Duration::from_millis(10)));

        let remover = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                state.remove(id);
            })
        };
        let mut quit = false;
        for _ in 0..100 {
            if state.wait_for_quit(Duration::from_millis(50)) {
                quit = true;
                break;
            }
        }
        remover.join().unwrap();
        assert!(quit);
    }

    #[test]
    fn test_tool_path_overwrite() {
        let state = ServiceState::new();
        state.set_tool_path("/usr/local/bin/smc");
        state.set_tool_path("/opt/smc");
        assert_eq!(state.tool_path(), Some(PathBuf::from("/opt/smc")));
    }
}
