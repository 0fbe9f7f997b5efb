use std::time::{Duration, Instant};

use ahash::HashMap;
use bytes::Bytes;
use codec::address::Address;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::Error;

/// Bound on outstanding exchanges; registrations beyond it fail with
/// `Overloaded`.
pub const MAX_IN_FLIGHT: usize = 1024;

/// Identity of an outstanding exchange: who we expect the reply from, on
/// which (service, channel), with which counter value.
///
/// Counters are 32-bit and wrap; promises live for seconds, so a wrapped
/// counter can never collide with a live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseKey {
    pub peer: Address,
    pub service: u16,
    pub channel: u16,
    pub counter: u32,
}

struct Slot {
    tx: oneshot::Sender<Result<Bytes, Error>>,
    deadline: Instant,
}

/// The pending half of an exchange. Awaiting it blocks only the caller.
pub struct Promise {
    rx: oneshot::Receiver<Result<Bytes, Error>>,
}

impl Promise {
    /// Resolve to the reply payload, or to the error the promise was
    /// failed with. Each promise reaches exactly one terminal state.
    pub async fn wait(self) -> Result<Bytes, Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// Table of outstanding exchange requests.
#[derive(Default)]
pub struct PromiseTable {
    slots: Mutex<HashMap<PromiseKey, Slot>>,
}

impl PromiseTable {
    pub fn register(
        &self,
        key: PromiseKey,
        timeout: Duration,
        now: Instant,
    ) -> Result<Promise, Error> {
        let mut slots = self.slots.lock();
        if slots.len() >= MAX_IN_FLIGHT {
            return Err(Error::Overloaded);
        }

        let (tx, rx) = oneshot::channel();
        slots.insert(
            key,
            Slot {
                tx,
                deadline: now + timeout,
            },
        );

        Ok(Promise { rx })
    }

    /// Complete a promise with a reply payload. Returns false when no
    /// such promise exists (late or unsolicited reply).
    pub fn fulfill(&self, key: &PromiseKey, payload: Bytes) -> bool {
        match self.slots.lock().remove(key) {
            Some(slot) => {
                let _ = slot.tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, key: &PromiseKey, error: Error) -> bool {
        match self.slots.lock().remove(key) {
            Some(slot) => {
                let _ = slot.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every promise whose deadline has passed, reclaiming the
    /// slots. Returns how many timed out.
    pub fn expire(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock();

        let expired: Vec<PromiseKey> = slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            if let Some(slot) = slots.remove(key) {
                let _ = slot.tx.send(Err(Error::Timeout));
            }
        }

        expired.len()
    }

    pub fn fail_all(&self, error: Error) {
        let mut slots = self.slots.lock();
        for (_, slot) in slots.drain() {
            let _ = slot.tx.send(Err(error));
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(counter: u32) -> PromiseKey {
        PromiseKey {
            peer: Address::new([1u8; 32]),
            service: 1,
            channel: 2,
            counter,
        }
    }

    #[test]
    fn fulfilled_promise_resolves_to_the_payload() {
        let table = PromiseTable::default();
        let promise = table
            .register(key(1), Duration::from_secs(5), Instant::now())
            .unwrap();

        assert!(table.fulfill(&key(1), Bytes::from_static(b"reply")));
        assert_eq!(
            pollster::block_on(promise.wait()),
            Ok(Bytes::from_static(b"reply"))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn late_reply_is_dropped() {
        let table = PromiseTable::default();
        let now = Instant::now();
        let promise = table.register(key(2), Duration::from_secs(1), now).unwrap();

        assert_eq!(table.expire(now + Duration::from_secs(1)), 1);
        assert_eq!(pollster::block_on(promise.wait()), Err(Error::Timeout));

        // The slot is reclaimed; the reply has nowhere to land.
        assert!(!table.fulfill(&key(2), Bytes::new()));
    }

    #[test]
    fn exactly_one_terminal_state() {
        let table = PromiseTable::default();
        let now = Instant::now();
        let promise = table.register(key(3), Duration::from_secs(1), now).unwrap();

        assert!(table.fulfill(&key(3), Bytes::new()));
        assert!(!table.fail(&key(3), Error::Shutdown));
        assert_eq!(table.expire(now + Duration::from_secs(10)), 0);
        assert_eq!(pollster::block_on(promise.wait()), Ok(Bytes::new()));
    }

    #[test]
    fn in_flight_promises_are_bounded() {
        let table = PromiseTable::default();
        let now = Instant::now();

        let promises: Vec<_> = (0..MAX_IN_FLIGHT as u32)
            .map(|i| table.register(key(i), Duration::from_secs(5), now).unwrap())
            .collect();

        assert!(matches!(
            table.register(key(u32::MAX), Duration::from_secs(5), now),
            Err(Error::Overloaded)
        ));

        drop(promises);
        table.fail_all(Error::Shutdown);
        assert!(table.is_empty());
    }
}
