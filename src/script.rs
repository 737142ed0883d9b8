use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::Result;
use serde_json::Value;

use crate::host::ScriptHost;

/// Identity handle for a loaded unit of user code. Ids are monotonic and never
/// reused, so holding a stale one is harmless. Tick and timer entries reference
/// scripts this way rather than by ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub(crate) u64);

impl ScriptId {
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Created,
    Loading,
    Loaded,
    LoadFailed,
    Unloading,
    Unloaded,
}

impl LoadState {
    pub fn label(self) -> &'static str {
        match self {
            LoadState::Created => "created",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
            LoadState::LoadFailed => "load_failed",
            LoadState::Unloading => "unloading",
            LoadState::Unloaded => "unloaded",
        }
    }
}

/// Hook set a `ScriptRuntime` installs while loading. Dropped wholesale at
/// unload, which is what tears down whatever interpreter state the closures
/// captured.
#[derive(Default)]
pub(crate) struct ScriptHooks {
    pub(crate) tick: Option<Box<dyn FnMut(f32) + Send>>,
    pub(crate) update: Option<Box<dyn FnMut(&Value) + Send>>,
    pub(crate) save: Option<Box<dyn FnMut(&Value) + Send>>,
    pub(crate) get_properties: Option<Box<dyn FnMut() -> Value + Send>>,
    pub(crate) on_unload: Option<Box<dyn FnMut() + Send>>,
}

pub(crate) struct ScriptInner {
    pub(crate) state: LoadState,
    pub(crate) settings: Value,
    pub(crate) description: String,
    pub(crate) last_error: Option<String>,
    pub(crate) last_modified: Option<SystemTime>,
    pub(crate) hooks: ScriptHooks,
}

/// A script tracked by the host. The mutex over `inner` is the per-script lock
/// everything in the lifecycle runs under; it is deliberately not reentrant —
/// hooks run while it is held and must route lifecycle operations on their own
/// script through `ScriptHost::post`.
pub struct Script {
    pub(crate) id: ScriptId,
    pub(crate) runtime_index: usize,
    pub(crate) runtime_name: &'static str,
    pub(crate) path: PathBuf,
    pub(crate) file: String,
    pub(crate) inner: Mutex<ScriptInner>,
}

impl Script {
    pub fn id(&self) -> ScriptId {
        self.id
    }

    /// Name of the runtime kind that owns this script (e.g. an extension tag).
    pub fn runtime_name(&self) -> &'static str {
        self.runtime_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File-name component of the path, used in log tags.
    pub fn file(&self) -> &str {
        &self.file
    }
}

/// Handed to a `ScriptRuntime` while a script is loading. The runtime installs
/// hooks through it and may reach the host to register callbacks; timer
/// registration is routed through the deferred-call queue because the load
/// path is still executing.
pub struct LoadContext<'a> {
    pub(crate) host: &'a ScriptHost,
    pub(crate) id: ScriptId,
    pub(crate) path: &'a Path,
    pub(crate) settings: &'a Value,
    pub(crate) hooks: &'a mut ScriptHooks,
    pub(crate) description: &'a mut String,
}

impl<'a> LoadContext<'a> {
    pub fn host(&self) -> &ScriptHost {
        self.host
    }

    pub fn script(&self) -> ScriptId {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.path
    }

    /// The script's current settings blob (a JSON object).
    pub fn settings(&self) -> &Value {
        self.settings
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        *self.description = description.into();
    }

    /// Installs the per-frame handler. Its presence is what places the script
    /// on the tick list once the load completes.
    pub fn on_tick(&mut self, hook: impl FnMut(f32) + Send + 'static) {
        self.hooks.tick = Some(Box::new(hook));
    }

    pub fn on_update(&mut self, hook: impl FnMut(&Value) + Send + 'static) {
        self.hooks.update = Some(Box::new(hook));
    }

    pub fn on_save(&mut self, hook: impl FnMut(&Value) + Send + 'static) {
        self.hooks.save = Some(Box::new(hook));
    }

    pub fn on_properties(&mut self, hook: impl FnMut() -> Value + Send + 'static) {
        self.hooks.get_properties = Some(Box::new(hook));
    }

    pub fn on_unload(&mut self, hook: impl FnMut() + Send + 'static) {
        self.hooks.on_unload = Some(Box::new(hook));
    }
}

/// A scripting-language backend. Implementations evaluate the script file and
/// install whatever hooks it defines; everything language-specific stays on
/// their side of this trait.
pub trait ScriptRuntime: Send + Sync {
    /// Runtime-kind tag, used in logs and exposed on `Script`.
    fn name(&self) -> &'static str;

    /// File extensions (without the dot) this runtime claims.
    fn extensions(&self) -> &[&'static str];

    /// Loads one script. Returning an error leaves the script in
    /// `LoadFailed`; the caller may retry later.
    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()>;
}
