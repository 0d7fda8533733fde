//! Session id to live stream mapping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Concurrency-safe table of live sessions.
///
/// One lock guards the map and is never held across I/O or an await.
/// Lookups of unknown ids return `None` rather than an error: late frames
/// for a session that already ended are expected.
#[derive(Debug)]
pub struct SessionTable<S> {
    sessions: RwLock<HashMap<u64, S>>,
    counter: AtomicU64,
}

impl<S> SessionTable<S> {
    /// Creates an empty table whose first attached id is 2, one above the
    /// highest reserved utility session.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_after(1)
    }

    /// Creates an empty table whose first attached id is `last_reserved + 1`.
    #[must_use]
    pub fn starting_after(last_reserved: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(last_reserved),
        }
    }

    /// Registers a locally opened session under a fresh id.
    ///
    /// Ids come from an atomic counter and are never handed out twice.
    pub fn attach(&self, stream: S) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.sessions.write().insert(id, stream);
        id
    }

    /// Registers a session whose id the peer chose.
    ///
    /// Fails, handing the stream back, if the id is already live.
    pub fn insert(&self, id: u64, stream: S) -> Result<(), S> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(stream);
        }
        sessions.insert(id, stream);
        Ok(())
    }

    /// Removes a session, returning its stream if it was live.
    pub fn detach(&self, id: u64) -> Option<S> {
        self.sessions.write().remove(&id)
    }

    /// Runs `f` against a live session's stream.
    pub fn with<R>(&self, id: u64, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.sessions.read().get(&id).map(f)
    }

    /// Checks whether a session is live.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.sessions.read().contains_key(&id)
    }

    /// Ids of all live sessions, in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.sessions.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Checks whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Removes and returns every live session.
    pub fn drain(&self) -> Vec<(u64, S)> {
        self.sessions.write().drain().collect()
    }
}

impl<S: Clone> SessionTable<S> {
    /// Returns a clone of a live session's stream.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<S> {
        self.sessions.read().get(&id).cloned()
    }
}

impl<S> Default for SessionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
