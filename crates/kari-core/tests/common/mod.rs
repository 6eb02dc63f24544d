//! Shared fixtures for the kari-core integration suites.
//!
//! - `Recorder`: records hook calls, action hits and flag updates
//! - `StubModule`: configurable module backed by a recorder
//! - helpers to lay out module roots and talk to a control socket

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use kari_core::control::ControlServer;
use kari_core::prelude::*;
use kari_core::{ModuleCatalog, Orchestrator, OrchestratorConfig, SocketConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

// ============================================================================
// Recorder
// ============================================================================

#[derive(Default)]
pub struct Recorder {
    hits: Mutex<HashMap<String, usize>>,
    events: Mutex<Vec<String>>,
    flags: Mutex<Vec<(String, ModuleFlags)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hit(&self, key: &str) {
        *self.hits.lock().entry(key.to_string()).or_default() += 1;
        self.events.lock().push(key.to_string());
    }

    pub fn hits(&self, key: &str) -> usize {
        self.hits.lock().get(key).copied().unwrap_or(0)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn record_flags(&self, module: &str, flags: ModuleFlags) {
        self.flags.lock().push((module.to_string(), flags));
    }

    pub fn last_flags(&self, module: &str) -> Option<ModuleFlags> {
        self.flags
            .lock()
            .iter()
            .rev()
            .find(|(name, _)| name == module)
            .map(|(_, flags)| *flags)
    }
}

// ============================================================================
// StubModule
// ============================================================================

/// Every action records `"<Module>.<action>"` on the recorder and returns
/// `{"module", "action", "args"}`.
pub struct StubModule {
    name: String,
    recorder: Arc<Recorder>,
    sync_actions: Vec<String>,
    async_actions: Vec<String>,
    failing: Vec<String>,
    panicking: Vec<String>,
    fail_init: bool,
    fail_async_init: bool,
    panic_on_debug: bool,
    ctx: Option<ModuleContext>,
}

impl StubModule {
    pub fn new(name: &str, recorder: &Arc<Recorder>) -> Self {
        Self {
            name: name.to_string(),
            recorder: Arc::clone(recorder),
            sync_actions: Vec::new(),
            async_actions: Vec::new(),
            failing: Vec::new(),
            panicking: Vec::new(),
            fail_init: false,
            fail_async_init: false,
            panic_on_debug: false,
            ctx: None,
        }
    }

    pub fn sync_action(mut self, action: &str) -> Self {
        self.sync_actions.push(action.to_string());
        self
    }

    pub fn async_action(mut self, action: &str) -> Self {
        self.async_actions.push(action.to_string());
        self
    }

    /// The named action returns an error.
    pub fn failing(mut self, action: &str) -> Self {
        self.failing.push(action.to_string());
        self
    }

    /// The named action panics.
    pub fn panicking(mut self, action: &str) -> Self {
        self.panicking.push(action.to_string());
        self
    }

    pub fn fail_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn fail_async_init(mut self) -> Self {
        self.fail_async_init = true;
        self
    }

    /// `on_flags` panics whenever debug is switched on.
    pub fn panic_on_debug(mut self) -> Self {
        self.panic_on_debug = true;
        self
    }

    pub fn boxed(self) -> Box<dyn Module> {
        Box::new(self)
    }

    fn key(&self, what: &str) -> String {
        format!("{}.{}", self.name, what)
    }
}

enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

fn respond(behaviour: &Behaviour, module: &str, action: &str, args: ActionArgs) -> ActionResult {
    match behaviour {
        Behaviour::Succeed => Ok(json!({"module": module, "action": action, "args": args})),
        Behaviour::Fail => Err(ModuleError::failed(format!("{action} refused"))),
        Behaviour::Panic => panic!("{action} exploded"),
    }
}

impl Module for StubModule {
    fn attach(&mut self, ctx: ModuleContext) {
        self.recorder.hit(&self.key("attach"));
        self.ctx = Some(ctx);
    }

    fn init(&mut self) -> Result<(), ModuleError> {
        self.recorder.hit(&self.key("init"));
        if self.fail_init {
            return Err(ModuleError::failed("init refused"));
        }
        Ok(())
    }

    fn initialize(self: Arc<Self>) -> Option<futures::future::BoxFuture<'static, Result<(), ModuleError>>> {
        Some(
            async move {
                tokio::task::yield_now().await;
                self.recorder.hit(&self.key("initialize"));
                if self.fail_async_init {
                    return Err(ModuleError::failed("async init refused"));
                }
                Ok(())
            }
            .boxed(),
        )
    }

    fn actions(self: Arc<Self>) -> ActionTable {
        let behaviour = |action: &str| {
            if self.panicking.iter().any(|a| a == action) {
                Behaviour::Panic
            } else if self.failing.iter().any(|a| a == action) {
                Behaviour::Fail
            } else {
                Behaviour::Succeed
            }
        };

        let mut table = ActionTable::new();
        for action in &self.sync_actions {
            let recorder = Arc::clone(&self.recorder);
            let module = self.name.clone();
            let name = action.clone();
            let behaviour = behaviour(action);
            table = table.sync(action.clone(), move |args| {
                recorder.hit(&format!("{module}.{name}"));
                respond(&behaviour, &module, &name, args)
            });
        }
        for action in &self.async_actions {
            let recorder = Arc::clone(&self.recorder);
            let module = self.name.clone();
            let name = action.clone();
            let behaviour = Arc::new(behaviour(action));
            table = table.asynchronous(action.clone(), move |args| {
                let recorder = Arc::clone(&recorder);
                let module = module.clone();
                let name = name.clone();
                let behaviour = Arc::clone(&behaviour);
                async move {
                    tokio::task::yield_now().await;
                    recorder.hit(&format!("{module}.{name}"));
                    respond(&behaviour, &module, &name, args)
                }
            });
        }
        table
    }

    fn on_flags(&self, flags: ModuleFlags) {
        self.recorder.record_flags(&self.name, flags);
        if self.panic_on_debug && flags.debug {
            panic!("{} cannot take debug", self.name);
        }
    }

    fn shutdown(&self) {
        self.recorder.hit(&self.key("shutdown"));
    }
}

// ============================================================================
// Module roots
// ============================================================================

/// Write `<root>/<unit>/module.toml`.
pub fn write_unit(root: &Path, unit: &str, manifest: &str) {
    let dir = root.join(unit);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("module.toml"), manifest).unwrap();
}

pub fn manifest_toml(name: &str, actions: &[&str], pulse: &[&str]) -> String {
    format!(
        "name = {:?}\nversion = \"1.0.0\"\nactions = {:?}\npulse = {:?}\n",
        name, actions, pulse
    )
}

/// Config rooted in `dir`: socket inside it, no voice announcements.
pub fn test_config(dir: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.socket = SocketConfig {
        enabled: true,
        path: dir.join("kari.sock"),
        fallback_path: dir.join("fallback.sock"),
        mode: 0o600,
    };
    config.modules.builtin_root = dir.join("builtin");
    config.modules.addon_root = dir.join("addons");
    config.voice_module = String::new();
    config
}

pub fn orchestrator(dir: &Path, catalog: ModuleCatalog) -> Arc<Orchestrator> {
    Orchestrator::new(test_config(dir), catalog)
}

/// Poll `condition` for up to a second.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Control socket client
// ============================================================================

/// Bind the configured socket and serve it in the background.
pub fn serve(core: &Arc<Orchestrator>) -> PathBuf {
    let server = ControlServer::bind(&core.config().socket).unwrap();
    let path = server.path().to_path_buf();
    tokio::spawn(server.serve(Arc::clone(core), futures::future::pending::<()>()));
    path
}

pub struct Session {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Session {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) -> Value {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send_bytes(&bytes).await
    }

    /// Write `bytes` as-is, newline included, and read one response.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Value {
        self.writer.write_all(bytes).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("response timed out")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&reply).unwrap()
    }
}

/// Error kind of a failed response, panicking on success.
pub fn error_kind(response: &Value) -> &str {
    assert_eq!(response["ok"], false, "expected failure, got {response}");
    response["error"]["kind"].as_str().unwrap()
}
