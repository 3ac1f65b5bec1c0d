use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one connection's fabric resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Uninitialized = 0,
    ResourcesBuilt = 1,
    Connected = 2,
    TornDown = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Uninitialized,
            1 => ConnectionState::ResourcesBuilt,
            2 => ConnectionState::Connected,
            _ => ConnectionState::TornDown,
        }
    }
}

/// Atomically readable connection state shared with the poller and senders.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from -> to`. On failure returns the state actually observed.
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let cell = StateCell::new(ConnectionState::Uninitialized);
        assert_eq!(
            cell.transition(ConnectionState::ResourcesBuilt, ConnectionState::Connected),
            Err(ConnectionState::Uninitialized)
        );
        cell.transition(ConnectionState::Uninitialized, ConnectionState::ResourcesBuilt)
            .unwrap();
        cell.transition(ConnectionState::ResourcesBuilt, ConnectionState::Connected).unwrap();
        assert_eq!(cell.load(), ConnectionState::Connected);
        cell.store(ConnectionState::TornDown);
        assert_eq!(cell.load(), ConnectionState::TornDown);
    }
}
