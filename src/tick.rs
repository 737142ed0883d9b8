use std::cell::Cell;
use std::sync::Mutex;

use crate::script::ScriptId;

thread_local! {
    static CURRENT_SCRIPT: Cell<Option<ScriptId>> = const { Cell::new(None) };
}

/// The script whose handler is currently executing on this thread, if any.
/// Diagnostic aid for host-side code that gets reentered from a handler.
pub fn current_script() -> Option<ScriptId> {
    CURRENT_SCRIPT.with(Cell::get)
}

pub(crate) struct CurrentScriptGuard {
    prev: Option<ScriptId>,
}

impl CurrentScriptGuard {
    pub(crate) fn enter(id: ScriptId) -> Self {
        let prev = CURRENT_SCRIPT.with(|cell| cell.replace(Some(id)));
        Self { prev }
    }
}

impl Drop for CurrentScriptGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT_SCRIPT.with(|cell| cell.set(prev));
    }
}

/// Scripts that registered a per-frame handler. A script enters at load (when
/// its runtime installed a tick hook) and leaves at unload; dispatch order is
/// most-recently-registered first.
#[derive(Default)]
pub struct TickList {
    scripts: Mutex<Vec<ScriptId>>,
}

impl TickList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: ScriptId) {
        let mut scripts = self.scripts.lock().unwrap();
        if !scripts.contains(&id) {
            scripts.push(id);
        }
    }

    pub(crate) fn unregister(&self, id: ScriptId) {
        self.scripts.lock().unwrap().retain(|entry| *entry != id);
    }

    pub fn contains(&self, id: ScriptId) -> bool {
        self.scripts.lock().unwrap().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.scripts.lock().unwrap().clear();
    }

    /// Runs `f` for every registered script, newest registration first, with
    /// the list lock held for the whole sweep. Registration from inside `f`
    /// would deadlock; handlers that need it must go through the deferred-call
    /// queue.
    pub(crate) fn for_each_lifo(&self, mut f: impl FnMut(ScriptId)) {
        let scripts = self.scripts.lock().unwrap();
        for id in scripts.iter().rev() {
            f(*id);
        }
    }
}
