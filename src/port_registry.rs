use std::sync::Mutex;

use rustc_hash::FxHashSet;
use tracing::debug;

/// Process-wide table of locally bound protocol ports, shared by all connections of a process
///  as an explicitly injected service (`Arc<PortRegistry>`), never as hidden global state -
///  tests run several simulated endpoints in one process without cross-talk.
///
/// All three operations are single critical sections: a listener allocating an ephemeral port
///  for a child connection can never race another connection into the same port.
pub struct PortRegistry {
    ports: Mutex<FxHashSet<u16>>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    pub fn new() -> PortRegistry {
        PortRegistry { ports: Mutex::new(FxHashSet::default()) }
    }

    /// Mark a port as in use. Duplicate reservation is tolerated: a listener's own port is
    ///  reserved once at creation and never reused by the children it spawns.
    pub fn reserve(&self, port: u16) {
        self.ports
            .lock()
            .expect("port registry mutex poisoned")
            .insert(port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.ports
            .lock()
            .expect("port registry mutex poisoned")
            .contains(&port)
    }

    /// Linear scan upward from `starting_at`, reserving and returning the first free port.
    ///  Used when a listener hands off an established session to a child connection on a
    ///  dedicated port, leaving the listening port free to keep listening.
    pub fn allocate_ephemeral(&self, starting_at: u16) -> u16 {
        let mut ports = self.ports.lock().expect("port registry mutex poisoned");
        let mut candidate = starting_at;
        while ports.contains(&candidate) {
            candidate = candidate
                .checked_add(1)
                .expect("ephemeral port range exhausted");
        }
        ports.insert(candidate);
        debug!("allocated ephemeral port {}", candidate);
        candidate
    }

    /// Remove a reservation. Idempotent - releasing a port that is not reserved is a no-op.
    pub fn release(&self, port: u16) {
        self.ports
            .lock()
            .expect("port registry mutex poisoned")
            .remove(&port);
    }
}
