//! Generation-checked arena routing completions back to their connection.

use std::sync::{Arc, Weak};

#[cfg(test)]
use mockall::automock;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::warn;

use crate::{
    api::ConnectionHandle,
    error::{RdmaLibError, Result},
    provider::WorkCompletion,
};

/// Receiver of completions whose work request id names its connection.
#[cfg_attr(test, automock)]
pub trait CompletionSink: Send + Sync {
    fn on_completion(&self, wc: &WorkCompletion);
}

static GLOBAL_TABLE: Lazy<Arc<ConnectionTable>> = Lazy::new(|| Arc::new(ConnectionTable::new()));

struct Slot {
    generation: u16,
    occupied: bool,
    sink: Option<Weak<dyn CompletionSink>>,
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

/// Maps [`ConnectionHandle`]s to weak references of their owners.
///
/// The table never keeps a connection alive. A slot's generation is bumped on
/// removal, so a completion arriving for a torn-down connection is dropped
/// instead of reaching whoever reuses the slot.
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<TableInner>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide table used by connections unless one is supplied.
    pub fn global() -> Arc<ConnectionTable> {
        GLOBAL_TABLE.clone()
    }

    /// Reserves a slot. Lookups on it return nothing until [`ConnectionTable::attach`].
    pub fn reserve(&self) -> Result<ConnectionHandle> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.free.pop() {
            let entry = &mut inner.slots[slot as usize];
            entry.occupied = true;
            return Ok(ConnectionHandle { slot, generation: entry.generation });
        }
        let slot = u16::try_from(inner.slots.len()).map_err(|_| RdmaLibError::TableFull)?;
        inner.slots.push(Slot { generation: 0, occupied: true, sink: None });
        Ok(ConnectionHandle { slot, generation: 0 })
    }

    pub fn attach(&self, handle: ConnectionHandle, sink: Weak<dyn CompletionSink>) -> bool {
        let mut inner = self.inner.write();
        match inner.slots.get_mut(handle.slot as usize) {
            Some(entry) if entry.occupied && entry.generation == handle.generation => {
                entry.sink = Some(sink);
                true
            }
            _ => false,
        }
    }

    pub fn insert(&self, sink: Weak<dyn CompletionSink>) -> Result<ConnectionHandle> {
        let handle = self.reserve()?;
        self.attach(handle, sink);
        Ok(handle)
    }

    /// Frees the slot. Returns false if `handle` was already stale.
    pub fn remove(&self, handle: ConnectionHandle) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.slots.get_mut(handle.slot as usize) else {
            return false;
        };
        if !entry.occupied || entry.generation != handle.generation {
            return false;
        }
        entry.occupied = false;
        entry.sink = None;
        entry.generation = entry.generation.wrapping_add(1);
        inner.free.push(handle.slot);
        true
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<Arc<dyn CompletionSink>> {
        let inner = self.inner.read();
        let entry = inner.slots.get(handle.slot as usize)?;
        if !entry.occupied || entry.generation != handle.generation {
            return None;
        }
        entry.sink.as_ref()?.upgrade()
    }

    /// Delivers `wc` to the connection named by its work request id.
    ///
    /// Returns false if the owner is gone.
    pub fn dispatch(&self, wc: &WorkCompletion) -> bool {
        let handle = wc.wr_id.handle();
        match self.get(handle) {
            Some(sink) => {
                sink.on_completion(wc);
                true
            }
            None => {
                warn!(
                    connection = ?handle,
                    wr_id = wc.wr_id.0,
                    opcode = ?wc.opcode,
                    "Dropping completion for unknown connection"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::WrId,
        provider::{CompletionOpcode, CompletionStatus},
    };

    fn completion(handle: ConnectionHandle) -> WorkCompletion {
        WorkCompletion {
            wr_id: WrId::new(handle, 42),
            status: CompletionStatus::Success,
            opcode: CompletionOpcode::Recv,
            byte_len: 32,
            imm_data: None,
            qp_num: 1,
        }
    }

    #[test]
    fn test_dispatch_to_live_sink() {
        let table = ConnectionTable::new();
        let mut sink = MockCompletionSink::new();
        sink.expect_on_completion()
            .withf(|wc| wc.wr_id.correlation() == 42)
            .times(1)
            .return_const(());
        let sink: Arc<dyn CompletionSink> = Arc::new(sink);
        let handle = table.insert(Arc::downgrade(&sink)).unwrap();
        assert!(table.dispatch(&completion(handle)));
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let table = ConnectionTable::new();
        let mut old = MockCompletionSink::new();
        old.expect_on_completion().never();
        let old: Arc<dyn CompletionSink> = Arc::new(old);
        let stale = table.insert(Arc::downgrade(&old)).unwrap();
        assert!(table.remove(stale));
        assert!(!table.remove(stale));

        let mut new = MockCompletionSink::new();
        new.expect_on_completion().times(1).return_const(());
        let new: Arc<dyn CompletionSink> = Arc::new(new);
        let fresh = table.insert(Arc::downgrade(&new)).unwrap();
        assert_eq!(fresh.slot, stale.slot);
        assert_ne!(fresh.generation, stale.generation);

        assert!(!table.dispatch(&completion(stale)));
        assert!(table.dispatch(&completion(fresh)));
    }

    #[test]
    fn test_dropped_owner_and_out_of_range() {
        let table = ConnectionTable::new();
        let sink: Arc<dyn CompletionSink> = Arc::new(MockCompletionSink::new());
        let handle = table.insert(Arc::downgrade(&sink)).unwrap();
        drop(sink);
        assert!(table.get(handle).is_none());
        assert!(!table.dispatch(&completion(handle)));
        assert!(!table.dispatch(&completion(ConnectionHandle { slot: 999, generation: 0 })));
    }

    #[test]
    fn test_reserved_slot_is_silent_until_attached() {
        let table = ConnectionTable::new();
        let handle = table.reserve().unwrap();
        assert!(table.get(handle).is_none());
        let mut sink = MockCompletionSink::new();
        sink.expect_on_completion().times(1).return_const(());
        let sink: Arc<dyn CompletionSink> = Arc::new(sink);
        assert!(table.attach(handle, Arc::downgrade(&sink)));
        assert!(table.dispatch(&completion(handle)));
    }
}
