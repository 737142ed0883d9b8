use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use scripthost::{FrameTick, HostConfig, LoadContext, ScriptHost, ScriptRuntime};

pub type Setup = Box<dyn Fn(&mut LoadContext<'_>) -> Result<()> + Send + Sync>;

/// Per-file load fixtures for the stub runtime. Tests register a closure that
/// plays the role of the script file's top-level code: it installs hooks and
/// registers callbacks through the `LoadContext`.
#[derive(Clone, Default)]
pub struct SetupMap {
    setups: Arc<Mutex<HashMap<String, Arc<Setup>>>>,
}

impl SetupMap {
    pub fn on_load(
        &self,
        file: &str,
        setup: impl Fn(&mut LoadContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) {
        self.setups.lock().unwrap().insert(file.to_string(), Arc::new(Box::new(setup)));
    }
}

/// Minimal language backend: "loading" a `.stub` script runs the fixture
/// registered for its file name.
pub struct StubRuntime {
    setups: SetupMap,
}

impl ScriptRuntime for StubRuntime {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn extensions(&self) -> &[&'static str] {
        &["stub"]
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
        let file = ctx
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let setup = self.setups.setups.lock().unwrap().get(&file).cloned();
        match setup {
            Some(setup) => setup(ctx),
            None => anyhow::bail!("no fixture registered for '{file}'"),
        }
    }
}

pub fn stub_host() -> (ScriptHost, SetupMap) {
    let setups = SetupMap::default();
    let runtime = StubRuntime { setups: setups.clone() };
    let host = ScriptHost::startup(HostConfig::default(), vec![Box::new(runtime)]);
    (host, setups)
}

pub fn frame(now_ms: u64, seconds: f32) -> FrameTick {
    FrameTick { now: Duration::from_millis(now_ms), seconds }
}
