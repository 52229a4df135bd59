//! # Hole-Punch Rendezvous Table
//!
//! While a hole punch is in flight, the dialer sprays random UDP toward the
//! remote endpoint and the regular accept path races to produce a matching
//! inbound session. This table is the rendezvous point: one pending entry
//! per `(remote address, remote peer)`, holding a single-slot delivery
//! channel. The accept path delivers at most once; taking the sender out of
//! the entry is what marks it fulfilled.
//!
//! The table is generic over the delivered value so the rendezvous protocol
//! can be exercised without standing up real QUIC sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::identity::PeerId;
use crate::transport::TransportError;

/// Identifies one pending hole punch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PunchKey {
    pub addr: SocketAddr,
    pub peer: PeerId,
}

struct PunchEntry<T> {
    /// `None` once a session has been delivered.
    delivery: Option<oneshot::Sender<T>>,
}

pub(crate) struct PunchTable<T> {
    entries: Mutex<HashMap<PunchKey, PunchEntry<T>>>,
}

impl<T> PunchTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending punch and hand back the delivery slot's receiving
    /// end. At most one punch per key may be in flight.
    pub(crate) fn start(&self, key: PunchKey) -> Result<oneshot::Receiver<T>, TransportError> {
        let mut entries = self.entries.lock().expect("punch table lock poisoned");
        if entries.contains_key(&key) {
            return Err(TransportError::AlreadyHolePunching(key.addr));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(key, PunchEntry { delivery: Some(tx) });
        Ok(rx)
    }

    /// Offer an inbound session to a waiting punch. The value comes back as
    /// `Err` when no punch is pending for the key, one was already
    /// fulfilled, or the dialer has given up; the caller then treats the
    /// session as a regular inbound connection.
    pub(crate) fn deliver(&self, key: &PunchKey, value: T) -> Result<(), T> {
        let mut entries = self.entries.lock().expect("punch table lock poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return Err(value);
        };
        let Some(tx) = entry.delivery.take() else {
            return Err(value);
        };
        tx.send(value)?;
        debug!(addr = %key.addr, peer = %key.peer, "delivered session to waiting hole punch");
        Ok(())
    }

    /// Remove the entry for a finished punch. A delivery that raced with the
    /// failure is salvaged with a non-blocking read while the table lock is
    /// still held, so it cannot be discarded.
    pub(crate) fn finish(&self, key: &PunchKey, rx: &mut oneshot::Receiver<T>) -> Option<T> {
        let mut entries = self.entries.lock().expect("punch table lock poisoned");
        entries.remove(key);
        rx.try_recv().ok()
    }

    /// Remove the entry without salvaging. Used when the dialing future is
    /// dropped and there is nobody left to hand a session to.
    pub(crate) fn abandon(&self, key: &PunchKey) {
        let mut entries = self.entries.lock().expect("punch table lock poisoned");
        entries.remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> PunchKey {
        PunchKey {
            addr: format!("192.0.2.1:{port}").parse().unwrap(),
            peer: PeerId::from_bytes([7u8; 32]),
        }
    }

    #[test]
    fn start_rejects_duplicate_punch() {
        let table: PunchTable<u32> = PunchTable::new();
        let _rx = table.start(key(1)).unwrap();

        let err = table.start(key(1)).unwrap_err();
        assert!(matches!(err, TransportError::AlreadyHolePunching(_)));

        // A different address is a different punch.
        let _other = table.start(key(2)).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn delivery_reaches_the_waiting_dialer() {
        let table: PunchTable<u32> = PunchTable::new();
        let rx = table.start(key(1)).unwrap();

        assert!(table.deliver(&key(1), 42).is_ok());
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn delivery_happens_at_most_once() {
        let table: PunchTable<u32> = PunchTable::new();
        let _rx = table.start(key(1)).unwrap();

        assert!(table.deliver(&key(1), 1).is_ok());
        assert_eq!(
            table.deliver(&key(1), 2),
            Err(2),
            "second delivery must be refused"
        );
    }

    #[test]
    fn delivery_without_pending_punch_is_refused() {
        let table: PunchTable<u32> = PunchTable::new();
        assert_eq!(table.deliver(&key(1), 1), Err(1));
    }

    #[test]
    fn finish_salvages_concurrent_delivery() {
        let table: PunchTable<u32> = PunchTable::new();
        let mut rx = table.start(key(1)).unwrap();

        // Delivery lands just before the dialer times out.
        assert!(table.deliver(&key(1), 99).is_ok());

        let salvaged = table.finish(&key(1), &mut rx);
        assert_eq!(salvaged, Some(99));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn finish_without_delivery_returns_none() {
        let table: PunchTable<u32> = PunchTable::new();
        let mut rx = table.start(key(1)).unwrap();

        assert_eq!(table.finish(&key(1), &mut rx), None);
        assert_eq!(table.len(), 0);

        // The punch is gone; a late delivery finds nothing.
        assert_eq!(table.deliver(&key(1), 1), Err(1));
    }

    #[test]
    fn abandon_clears_entry() {
        let table: PunchTable<u32> = PunchTable::new();
        let _rx = table.start(key(1)).unwrap();
        table.abandon(&key(1));
        assert_eq!(table.len(), 0);
    }
}
