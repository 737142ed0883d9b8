use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::script::ScriptId;

/// Invocable payload of a registered callback. Language layers capture whatever
/// interpreter state they need inside the closure; the core never looks inside.
pub type CallbackHandler = dyn Fn() + Send + Sync;

/// Hook run exactly once when a callback is removed, after it has already been
/// unlinked from its owner's live list. May freely call back into the registry.
pub type RemoveHook = Box<dyn FnOnce() + Send>;

/// Handle to a callback record. Packs an arena index and a generation counter
/// so a stale handle is always detectably dead instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId {
    index: u32,
    generation: u32,
}

impl CallbackId {
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self { index: bits as u32, generation: (bits >> 32) as u32 }
    }
}

enum Home {
    Live,
    Detached,
}

struct CallbackRecord {
    owner: ScriptId,
    removed: bool,
    home: Home,
    handler: Option<Arc<CallbackHandler>>,
    on_remove: Option<RemoveHook>,
    extra: BTreeMap<String, String>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    record: Option<CallbackRecord>,
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live_heads: HashMap<ScriptId, u32>,
    detached_head: Option<u32>,
    detached_len: usize,
}

/// Arena of callback registrations plus the detached graveyard.
///
/// Every record lives in exactly one index chain at a time: its owner's live
/// list while registered, then the graveyard from the instant it is removed
/// until `drain_detached` frees it. The move between the two happens atomically
/// under the registry lock, so an owner list never shows a removed entry and a
/// removed entry stays addressable (for `is_removed` checks) until the drain.
pub struct CallbackRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(RegistryInner::default()) }
    }

    /// Registers a callback owned by `owner`, linked at the head of its live
    /// list. Infallible by policy; the returned id is the only way back to it.
    pub fn add(&self, owner: ScriptId, handler: impl Fn() + Send + Sync + 'static) -> CallbackId {
        let record = CallbackRecord {
            owner,
            removed: false,
            home: Home::Live,
            handler: Some(Arc::new(handler)),
            on_remove: None,
            extra: BTreeMap::new(),
            prev: None,
            next: None,
        };
        let mut inner = self.inner.lock().unwrap();
        let index = inner.allocate(record);
        inner.link_live_head(owner, index);
        CallbackId { index, generation: inner.slots[index as usize].generation }
    }

    /// Installs the remove hook. Returns false if the callback is gone or
    /// already removed (the hook is dropped unrun in that case).
    pub fn set_on_remove(&self, id: CallbackId, hook: impl FnOnce() + Send + 'static) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.live_record_mut(id) {
            Some(record) => {
                record.on_remove = Some(Box::new(hook));
                true
            }
            None => false,
        }
    }

    pub fn set_extra(&self, id: CallbackId, key: &str, value: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.live_record_mut(id) {
            Some(record) => {
                record.extra.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    /// Extra data is readable only while the callback is live; once removed it
    /// belongs to the graveyard and is released by the drain.
    pub fn extra(&self, id: CallbackId, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.live_record_mut(id).and_then(|record| record.extra.get(key).cloned())
    }

    /// Marks the callback removed, moves it from the owner's live list into the
    /// graveyard, then runs its remove hook outside the lock. Idempotent:
    /// removing a stale or already-removed id is a no-op.
    pub fn remove(&self, id: CallbackId) {
        let hook = {
            let mut inner = self.inner.lock().unwrap();
            match inner.detach(id) {
                Some(hook) => hook,
                None => return,
            }
        };
        run_remove_hook(hook);
    }

    /// Removes every callback owned by `owner`, head first (most recently
    /// registered first), running each remove hook with no lock held so hooks
    /// may remove siblings or themselves without deadlock or double-free.
    pub fn remove_all_for(&self, owner: ScriptId) {
        loop {
            let hook = {
                let mut inner = self.inner.lock().unwrap();
                let Some(&head) = inner.live_heads.get(&owner) else {
                    return;
                };
                let id = CallbackId { index: head, generation: inner.slots[head as usize].generation };
                match inner.detach(id) {
                    Some(hook) => hook,
                    None => return,
                }
            };
            run_remove_hook(hook);
        }
    }

    /// Frees a callback's storage right away, without the graveyard round-trip
    /// and without running its remove hook. For direct engine-shutdown cleanup
    /// of entries nothing else can still be observing.
    pub fn free_immediately(&self, id: CallbackId) {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            inner.release(id)
        };
        drop(dropped);
    }

    /// Walks the graveyard and frees every entry exactly once, returning how
    /// many were still detached. Called at engine shutdown.
    pub fn drain_detached(&self) -> usize {
        let records = {
            let mut inner = self.inner.lock().unwrap();
            let mut records = Vec::with_capacity(inner.detached_len);
            while let Some(head) = inner.detached_head {
                let id = CallbackId { index: head, generation: inner.slots[head as usize].generation };
                if let Some(record) = inner.release(id) {
                    records.push(record);
                }
            }
            records
        };
        // Record drops (and any Drop impls captured inside hooks/handlers) run
        // without the registry lock held.
        records.len()
    }

    /// True for removed callbacks and for ids whose record no longer exists.
    pub fn is_removed(&self, id: CallbackId) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.record(id) {
            Some(record) => record.removed,
            None => true,
        }
    }

    pub fn owner(&self, id: CallbackId) -> Option<ScriptId> {
        let inner = self.inner.lock().unwrap();
        inner.record(id).map(|record| record.owner)
    }

    /// Hands out the handler for invocation, or None once removed. The clone
    /// keeps an in-flight invocation valid even if the callback is removed
    /// concurrently; invokers are expected to re-check `is_removed` first.
    pub fn handler(&self, id: CallbackId) -> Option<Arc<CallbackHandler>> {
        let inner = self.inner.lock().unwrap();
        inner.record(id).filter(|record| !record.removed).and_then(|record| record.handler.clone())
    }

    /// Live callbacks of `owner` in list order (most recently registered first).
    pub fn live_callbacks(&self, owner: ScriptId) -> Vec<CallbackId> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut cursor = inner.live_heads.get(&owner).copied();
        while let Some(index) = cursor {
            out.push(CallbackId { index, generation: inner.slots[index as usize].generation });
            cursor = inner.slots[index as usize].record.as_ref().and_then(|record| record.next);
        }
        out
    }

    /// Graveyard contents, newest removal first.
    pub fn detached(&self) -> Vec<CallbackId> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut cursor = inner.detached_head;
        while let Some(index) = cursor {
            out.push(CallbackId { index, generation: inner.slots[index as usize].generation });
            cursor = inner.slots[index as usize].record.as_ref().and_then(|record| record.next);
        }
        out
    }

    pub fn detached_len(&self) -> usize {
        self.inner.lock().unwrap().detached_len
    }
}

fn run_remove_hook(hook: Option<RemoveHook>) {
    if let Some(hook) = hook {
        if catch_unwind(AssertUnwindSafe(hook)).is_err() {
            log::warn!("[scripting] callback remove hook panicked; removal continues");
        }
    }
}

impl RegistryInner {
    fn allocate(&mut self, record: CallbackRecord) -> u32 {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            index
        } else {
            self.slots.push(Slot { generation: 1, record: Some(record) });
            (self.slots.len() - 1) as u32
        }
    }

    fn record(&self, id: CallbackId) -> Option<&CallbackRecord> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_mut(&mut self, id: CallbackId) -> Option<&mut CallbackRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    fn live_record_mut(&mut self, id: CallbackId) -> Option<&mut CallbackRecord> {
        self.record_mut(id).filter(|record| !record.removed)
    }

    fn link_live_head(&mut self, owner: ScriptId, index: u32) {
        let old_head = self.live_heads.insert(owner, index);
        if let Some(old) = old_head {
            if let Some(record) = self.slots[old as usize].record.as_mut() {
                record.prev = Some(index);
            }
        }
        let record = self.slots[index as usize].record.as_mut().unwrap();
        record.home = Home::Live;
        record.prev = None;
        record.next = old_head;
    }

    fn link_detached_head(&mut self, index: u32) {
        let old_head = self.detached_head.replace(index);
        if let Some(old) = old_head {
            if let Some(record) = self.slots[old as usize].record.as_mut() {
                record.prev = Some(index);
            }
        }
        let record = self.slots[index as usize].record.as_mut().unwrap();
        record.home = Home::Detached;
        record.prev = None;
        record.next = old_head;
        self.detached_len += 1;
    }

    /// O(1) unlink from whichever chain currently holds the record.
    fn unlink(&mut self, index: u32) {
        let (owner, prev, next, home_live) = {
            let record = self.slots[index as usize].record.as_ref().unwrap();
            (record.owner, record.prev, record.next, matches!(record.home, Home::Live))
        };
        match prev {
            Some(prev) => {
                if let Some(record) = self.slots[prev as usize].record.as_mut() {
                    record.next = next;
                }
            }
            None => {
                if home_live {
                    match next {
                        Some(next) => {
                            self.live_heads.insert(owner, next);
                        }
                        None => {
                            self.live_heads.remove(&owner);
                        }
                    }
                } else {
                    self.detached_head = next;
                }
            }
        }
        if let Some(next) = next {
            if let Some(record) = self.slots[next as usize].record.as_mut() {
                record.prev = prev;
            }
        }
        if !home_live {
            self.detached_len -= 1;
        }
        let record = self.slots[index as usize].record.as_mut().unwrap();
        record.prev = None;
        record.next = None;
    }

    /// Live -> detached transition. Returns the remove hook to run outside the
    /// lock, or None if the id was stale or already detached.
    fn detach(&mut self, id: CallbackId) -> Option<Option<RemoveHook>> {
        {
            let record = self.record_mut(id)?;
            if record.removed {
                return None;
            }
            record.removed = true;
        }
        self.unlink(id.index);
        self.link_detached_head(id.index);
        let record = self.record_mut(id).unwrap();
        Some(record.on_remove.take())
    }

    /// Unlinks and frees the slot. Returns the record so its drop can run
    /// outside the lock.
    fn release(&mut self, id: CallbackId) -> Option<CallbackRecord> {
        self.record(id)?;
        self.unlink(id.index);
        let slot = &mut self.slots[id.index as usize];
        let record = slot.record.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(id.index);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_id_bits_round_trip() {
        let id = CallbackId { index: 7, generation: 3 };
        assert_eq!(CallbackId::from_bits(id.to_bits()), id);
    }
}
