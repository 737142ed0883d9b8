pub mod callbacks;
pub mod config;
pub mod defer;
pub mod host;
pub mod script;
pub mod tick;
pub mod time;
pub mod timers;

pub use callbacks::{CallbackId, CallbackRegistry};
pub use config::HostConfig;
pub use host::{ScriptHost, ShutdownReport};
pub use script::{LoadContext, LoadState, Script, ScriptId, ScriptRuntime};
pub use tick::current_script;
pub use time::{FrameClock, FrameTick};
