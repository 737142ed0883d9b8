use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use crate::callbacks::{CallbackId, CallbackRegistry};
use crate::config::HostConfig;
use crate::defer::DeferQueue;
use crate::script::{LoadContext, LoadState, Script, ScriptHooks, ScriptId, ScriptInner, ScriptRuntime};
use crate::tick::{CurrentScriptGuard, TickList};
use crate::time::FrameTick;
use crate::timers::TimerScheduler;

/// Counts reported by `ScriptHost::shutdown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownReport {
    /// Callbacks that were still detached-but-unfreed when the graveyard was
    /// drained.
    pub detached_freed: usize,
}

/// The scripting host: owns every registry and the script table, and exposes
/// the lifecycle and callback operations language layers are built on.
///
/// Reentrancy rules: callback, deferred-call, and timer operations never take a
/// script lock, so script hooks may call them directly. Lifecycle operations
/// (`load`, `unload`, `reload`, `update`, ...) take the target script's lock
/// and must not be called from a hook of that same script — post them through
/// `post` instead.
pub struct ScriptHost {
    config: HostConfig,
    runtimes: Vec<Box<dyn ScriptRuntime>>,
    scripts: Mutex<HashMap<ScriptId, Arc<Script>>>,
    registry: Arc<CallbackRegistry>,
    timers: Arc<TimerScheduler>,
    ticks: TickList,
    defer: DeferQueue,
    next_script_id: AtomicU64,
    shut_down: AtomicBool,
}

impl ScriptHost {
    /// Initializes every registry and spawns the deferred-call worker thread.
    pub fn startup(config: HostConfig, runtimes: Vec<Box<dyn ScriptRuntime>>) -> Self {
        let defer = DeferQueue::start(&config.worker_thread_name);
        log::info!(
            "[scripting] host started with {} runtime(s): {}",
            runtimes.len(),
            runtimes.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
        );
        Self {
            config,
            runtimes,
            scripts: Mutex::new(HashMap::new()),
            registry: Arc::new(CallbackRegistry::new()),
            timers: Arc::new(TimerScheduler::new()),
            ticks: TickList::new(),
            defer,
            next_script_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registers a script with the host without loading it. The runtime is
    /// picked by file extension; an extension no runtime claims is an error.
    /// The file itself does not have to exist yet — `load` reports that.
    pub fn create(&self, path: impl AsRef<Path>, settings: Value) -> Result<ScriptId> {
        let path = self.config.resolve_script_path(path.as_ref());
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| anyhow!("script '{}' has no file extension", path.display()))?;
        let runtime_index = self
            .runtimes
            .iter()
            .position(|runtime| runtime.extensions().contains(&extension.as_str()))
            .ok_or_else(|| anyhow!("no script runtime registered for '.{extension}' files"))?;
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let id = ScriptId(self.next_script_id.fetch_add(1, Ordering::Relaxed));
        let script = Arc::new(Script {
            id,
            runtime_index,
            runtime_name: self.runtimes[runtime_index].name(),
            path,
            file,
            inner: Mutex::new(ScriptInner {
                state: LoadState::Created,
                settings: normalize_settings(settings),
                description: String::new(),
                last_error: None,
                last_modified: None,
                hooks: ScriptHooks::default(),
            }),
        });
        log::info!("[scripting] created {} script: {}", script.runtime_name, script.file);
        self.scripts.lock().unwrap().insert(id, script);
        Ok(id)
    }

    /// Runs the script's runtime load path and installs its hooks. A failure
    /// leaves the script in `LoadFailed` with the error recorded; callers may
    /// retry. Loading an already-loaded script is a no-op.
    pub fn load(&self, id: ScriptId) -> Result<()> {
        let script = self.script(id).ok_or_else(|| anyhow!("script {id:?} does not exist"))?;
        let runtime = &self.runtimes[script.runtime_index];

        let mut inner = script.inner.lock().unwrap();
        match inner.state {
            LoadState::Loaded => return Ok(()),
            LoadState::Loading | LoadState::Unloading => {
                bail!("script '{}' is busy ({})", script.file, inner.state.label())
            }
            LoadState::Created | LoadState::LoadFailed | LoadState::Unloaded => {}
        }
        inner.state = LoadState::Loading;
        inner.last_error = None;

        let settings = inner.settings.clone();
        let mut hooks = ScriptHooks::default();
        let mut description = String::new();
        let result = {
            let mut ctx = LoadContext {
                host: self,
                id,
                path: &script.path,
                settings: &settings,
                hooks: &mut hooks,
                description: &mut description,
            };
            catch_unwind(AssertUnwindSafe(|| runtime.load(&mut ctx)))
                .unwrap_or_else(|_| Err(anyhow!("script runtime panicked during load")))
        };

        match result {
            Ok(()) => {
                let has_tick = hooks.tick.is_some();
                inner.hooks = hooks;
                inner.description = description;
                inner.last_modified =
                    fs::metadata(&script.path).ok().and_then(|meta| meta.modified().ok());
                inner.state = LoadState::Loaded;
                drop(inner);
                if has_tick {
                    self.ticks.register(id);
                }
                log::info!("[scripting] loaded {} script: {}", script.runtime_name, script.file);
                Ok(())
            }
            Err(err) => {
                inner.state = LoadState::LoadFailed;
                inner.last_error = Some(format!("{err:#}"));
                drop(inner);
                log::warn!("[script:{}] load failed: {err:#}", script.file);
                Err(err).with_context(|| format!("loading script '{}'", script.file))
            }
        }
    }

    /// Unloads a script: tick-list removal, `on_unload` hook, removal of every
    /// callback it owns (each remove hook runs), then runtime-state teardown.
    /// A script that is not loaded is left untouched.
    pub fn unload(&self, id: ScriptId) {
        if let Some(script) = self.script(id) {
            self.unload_script(&script);
        }
    }

    /// Unload, a deferred-call barrier, then load. The barrier guarantees no
    /// deferred registration from the old incarnation lands after the new one
    /// starts.
    pub fn reload(&self, id: ScriptId) -> Result<()> {
        self.unload(id);
        self.defer.drain_and_wait();
        self.load(id)
    }

    /// Reloads only when the file on disk is newer than what was loaded.
    /// Returns whether a reload happened.
    pub fn reload_if_modified(&self, id: ScriptId) -> Result<bool> {
        let script = self.script(id).ok_or_else(|| anyhow!("script {id:?} does not exist"))?;
        let modified = fs::metadata(&script.path)
            .with_context(|| format!("script file '{}' not accessible", script.path.display()))?
            .modified()
            .with_context(|| format!("script file '{}' has no mtime", script.path.display()))?;
        let stale = {
            let inner = script.inner.lock().unwrap();
            inner.state != LoadState::Loaded
                || inner.last_modified.map_or(true, |prev| modified > prev)
        };
        if stale {
            self.reload(id)?;
        }
        Ok(stale)
    }

    /// Removes the script from the host, unloading it first if needed.
    pub fn destroy(&self, id: ScriptId) {
        let script = self.scripts.lock().unwrap().remove(&id);
        if let Some(script) = script {
            self.unload_script(&script);
            log::info!("[scripting] destroyed {} script: {}", script.runtime_name, script.file);
        }
    }

    /// Merges a settings patch into the script's settings blob and, when the
    /// script is loaded, hands the merged blob to its update hook.
    pub fn update(&self, id: ScriptId, patch: &Value) -> Result<()> {
        let script = self.script(id).ok_or_else(|| anyhow!("script {id:?} does not exist"))?;
        let mut inner = script.inner.lock().unwrap();
        merge_settings(&mut inner.settings, patch);
        if inner.state != LoadState::Loaded {
            return Ok(());
        }
        let settings = inner.settings.clone();
        if let Some(hook) = inner.hooks.update.as_mut() {
            let _guard = CurrentScriptGuard::enter(id);
            if catch_unwind(AssertUnwindSafe(|| hook(&settings))).is_err() {
                log::warn!("[script:{}] update hook panicked", script.file);
            }
        }
        Ok(())
    }

    /// Asks the script to describe its configurable properties. `None` when
    /// the script is not loaded or installed no properties hook.
    pub fn get_properties(&self, id: ScriptId) -> Option<Value> {
        let script = self.script(id)?;
        let mut inner = script.inner.lock().unwrap();
        if inner.state != LoadState::Loaded {
            return None;
        }
        let hook = inner.hooks.get_properties.as_mut()?;
        let _guard = CurrentScriptGuard::enter(id);
        match catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(properties) => Some(properties),
            Err(_) => {
                log::warn!("[script:{}] properties hook panicked", script.file);
                None
            }
        }
    }

    /// Gives the script a chance to serialize state into its settings blob.
    pub fn save(&self, id: ScriptId) {
        let Some(script) = self.script(id) else {
            return;
        };
        let mut inner = script.inner.lock().unwrap();
        if inner.state != LoadState::Loaded {
            return;
        }
        let settings = inner.settings.clone();
        if let Some(hook) = inner.hooks.save.as_mut() {
            let _guard = CurrentScriptGuard::enter(id);
            if catch_unwind(AssertUnwindSafe(|| hook(&settings))).is_err() {
                log::warn!("[script:{}] save hook panicked", script.file);
            }
        }
    }

    // ---- boundary operations consumed by language layers ----

    /// Registers a callback owned by `script`. O(1); infallible by policy.
    pub fn add_callback(&self, script: ScriptId, handler: impl Fn() + Send + Sync + 'static) -> CallbackId {
        self.registry.add(script, handler)
    }

    /// Marks the callback removed, detaches it into the graveyard, and runs
    /// its remove hook. Idempotent; safe from any thread, including from
    /// inside the callback's own invocation.
    pub fn remove_callback(&self, id: CallbackId) {
        self.registry.remove(id);
    }

    /// Posts work onto the serialized worker queue. Silently dropped once
    /// shutdown has been requested.
    pub fn post(&self, call: impl FnOnce() + Send + 'static) {
        self.defer.post(call);
    }

    /// Blocks until every previously posted deferred call has executed.
    pub fn drain_deferred(&self) {
        self.defer.drain_and_wait();
    }

    /// Places a script on the tick list. Normally implicit: a script whose
    /// load installed a tick hook is registered automatically.
    pub fn register_tick(&self, id: ScriptId) {
        let known = self.scripts.lock().unwrap().contains_key(&id);
        if known {
            self.ticks.register(id);
        }
    }

    /// Attaches an interval timer to an existing callback. The list insertion
    /// itself is posted through the deferred-call queue, because timer
    /// registration happens from inside script load paths.
    pub fn register_timer(&self, callback: CallbackId, interval: Duration) {
        let registry = Arc::clone(&self.registry);
        let timers = Arc::clone(&self.timers);
        self.defer.post(move || {
            if registry.is_removed(callback) {
                return;
            }
            timers.schedule(callback, interval);
        });
    }

    /// One host frame: dispatches every registered tick handler (newest
    /// registration first, each under its script's lock), then runs the timer
    /// pass against `frame.now`.
    pub fn tick(&self, frame: FrameTick) {
        self.timers.set_now(frame.now);

        self.ticks.for_each_lifo(|id| {
            let Some(script) = self.script(id) else {
                return;
            };
            let mut inner = script.inner.lock().unwrap();
            if inner.state != LoadState::Loaded {
                return;
            }
            if let Some(hook) = inner.hooks.tick.as_mut() {
                let _guard = CurrentScriptGuard::enter(id);
                if catch_unwind(AssertUnwindSafe(|| hook(frame.seconds))).is_err() {
                    log::warn!("[script:{}] tick handler panicked", script.file);
                }
            }
        });

        let due = self.timers.sweep(frame.now, &self.registry);
        for callback in due {
            if self.registry.is_removed(callback) {
                continue;
            }
            let Some(handler) = self.registry.handler(callback) else {
                continue;
            };
            let owner = self.registry.owner(callback).and_then(|id| self.script(id));
            // Hold the owning script's lock so a timer handler cannot race a
            // concurrent unload of its script.
            let _inner = owner.as_ref().map(|script| script.inner.lock().unwrap());
            let _guard = owner.as_ref().map(|script| CurrentScriptGuard::enter(script.id));
            if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                let file = owner.as_ref().map(|script| script.file.as_str()).unwrap_or("<gone>");
                log::warn!("[script:{file}] timer handler panicked");
            }
        }
    }

    /// Stops dispatch, shuts the deferred-call queue down, unloads every
    /// remaining script, and drains the graveyard. Runs at most once; `Drop`
    /// falls back to it.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        self.ticks.clear();
        self.defer.shutdown();

        let scripts: Vec<Arc<Script>> = self.scripts.lock().unwrap().drain().map(|(_, s)| s).collect();
        for script in &scripts {
            self.unload_script(script);
        }
        self.timers.clear();

        let detached_freed = self.registry.drain_detached();
        log::info!("[scripting] shutdown complete; freed {detached_freed} detached callbacks");
        ShutdownReport { detached_freed }
    }

    // ---- queries ----

    pub fn script(&self, id: ScriptId) -> Option<Arc<Script>> {
        self.scripts.lock().unwrap().get(&id).cloned()
    }

    pub fn scripts(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<Arc<Script>> = self.scripts.lock().unwrap().values().cloned().collect();
        scripts.sort_by_key(|script| script.id);
        scripts
    }

    pub fn state(&self, id: ScriptId) -> Option<LoadState> {
        self.script(id).map(|script| script.inner.lock().unwrap().state)
    }

    pub fn last_error(&self, id: ScriptId) -> Option<String> {
        self.script(id).and_then(|script| script.inner.lock().unwrap().last_error.clone())
    }

    pub fn description(&self, id: ScriptId) -> Option<String> {
        self.script(id).map(|script| script.inner.lock().unwrap().description.clone())
    }

    pub fn settings(&self, id: ScriptId) -> Option<Value> {
        self.script(id).map(|script| script.inner.lock().unwrap().settings.clone())
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Cloneable handle to the registry, for handlers that need to remove
    /// callbacks (their own included) from inside an invocation.
    pub fn callbacks_handle(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn tick_list(&self) -> &TickList {
        &self.ticks
    }

    pub fn timer_scheduler(&self) -> &TimerScheduler {
        &self.timers
    }

    // ---- internals ----

    fn unload_script(&self, script: &Script) {
        self.ticks.unregister(script.id);

        let mut inner = script.inner.lock().unwrap();
        if inner.state != LoadState::Loaded {
            return;
        }
        inner.state = LoadState::Unloading;

        if let Some(mut hook) = inner.hooks.on_unload.take() {
            let _guard = CurrentScriptGuard::enter(script.id);
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                log::warn!("[script:{}] unload hook panicked", script.file);
            }
        }

        // Every callback the script still owns moves to the graveyard; each
        // remove hook fires here, which is where host-side unregistration
        // happens.
        self.registry.remove_all_for(script.id);

        let hooks = std::mem::take(&mut inner.hooks);
        inner.state = LoadState::Unloaded;
        drop(inner);
        // Dropping the hook set tears down whatever runtime state the load
        // captured, outside the script lock.
        drop(hooks);

        log::info!("[scripting] unloaded {} script: {}", script.runtime_name, script.file);
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn normalize_settings(settings: Value) -> Value {
    match settings {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Shallow key merge of a settings patch on top of the stored blob.
fn merge_settings(settings: &mut Value, patch: &Value) {
    let (Value::Object(settings), Value::Object(patch)) = (settings, patch) else {
        return;
    };
    for (key, value) in patch {
        settings.insert(key.clone(), value.clone());
    }
}
