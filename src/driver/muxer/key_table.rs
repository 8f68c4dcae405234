use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use parking_lot::Mutex;
use tracing::trace;

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// The number of keys that can be registered at the same time
pub const MAX_LIVE_KEYS: usize = INDEX_MASK as usize + 1;

/// A 32-bit demultiplexing key, identifying a connection's receiving side within a shared UDP
///  socket. It travels as the first four bytes (network byte order) of every datagram.
///
/// The low 24 bits are a slot index, and the high 8 bits are the slot's generation at the time
///  of registration. Releasing a key bumps the slot's generation, so a released key does not
///  match the slot's next registration, and late datagrams for a closed connection are dropped
///  instead of being delivered to an unrelated one (unless the slot is reused 256 times in
///  between).
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct MuxKey(pub u32);

impl MuxKey {
    fn new(index: usize, generation: u8) -> MuxKey {
        let index: u32 = index.prechecked_cast();
        let generation: u32 = generation.safe_cast();
        MuxKey((generation << INDEX_BITS) | index)
    }

    fn index(&self) -> usize {
        (self.0 & INDEX_MASK).safe_cast()
    }

    fn generation(&self) -> u8 {
        (self.0 >> INDEX_BITS).prechecked_cast()
    }
}

impl Debug for MuxKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06x}/{}", self.0 & INDEX_MASK, self.generation())
    }
}
impl Display for MuxKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

struct Slot<H> {
    generation: u8,
    handle: Option<H>,
}

struct Slots<H> {
    slots: Vec<Slot<H>>,
    /// indexes of unoccupied slots
    free: Vec<usize>,
}

/// A concurrent mapping from [MuxKey] to the handle of the endpoint receiving under that key.
///  Keys are allocated by the table itself, which makes them unique among registered keys.
///
/// All operations take one short-lived lock, so a receive loop calling [KeyRoutingTable::locate]
///  for every datagram is not blocked for long by setup and teardown on other threads.
pub struct KeyRoutingTable<H: Clone> {
    inner: Mutex<Slots<H>>,
}

impl<H: Clone> Default for KeyRoutingTable<H> {
    fn default() -> Self {
        KeyRoutingTable::new()
    }
}

impl<H: Clone> KeyRoutingTable<H> {
    pub fn new() -> KeyRoutingTable<H> {
        KeyRoutingTable {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Allocates a fresh key and registers `handle` under it
    pub fn register(&self, handle: H) -> anyhow::Result<MuxKey> {
        let mut inner = self.inner.lock();

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() >= MAX_LIVE_KEYS {
                    bail!("all {} mux keys are in use", MAX_LIVE_KEYS);
                }
                inner.slots.push(Slot { generation: 0, handle: None });
                inner.slots.len() - 1
            }
        };

        let slot = &mut inner.slots[index];
        slot.handle = Some(handle);
        let key = MuxKey::new(index, slot.generation);
        trace!("registered mux key {}", key);
        Ok(key)
    }

    pub fn locate(&self, key: MuxKey) -> Option<H> {
        let inner = self.inner.lock();
        match inner.slots.get(key.index()) {
            Some(slot) if slot.generation == key.generation() => slot.handle.clone(),
            _ => None,
        }
    }

    /// Returns the handle that was registered under `key`, or `None` if the key is not (or no
    ///  longer) registered
    pub fn release(&self, key: MuxKey) -> Option<H> {
        let mut inner = self.inner.lock();
        let index = key.index();

        let slot = match inner.slots.get_mut(index) {
            Some(slot) if slot.generation == key.generation() && slot.handle.is_some() => slot,
            _ => {
                trace!("releasing mux key {} that is not registered - ignoring", key);
                return None;
            }
        };

        let handle = slot.handle.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(index);
        trace!("released mux key {}", key);
        handle
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
