use anyhow::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker};

use crate::composer::CallContext;
use crate::config::SandboxSettings;
use crate::error::SkillError;
use crate::host::{self, SkillState};
use crate::registry::{Skill, SkillMetadata, SkillRuntime};
use crate::script::{ScriptCallable, ScriptIsolation};
use crate::wasm::WasmCallable;

/// How often the engine epoch advances; bounds deadline overshoot
const EPOCH_TICK: Duration = Duration::from_millis(10);

// ==================== Sandbox Configuration ====================

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget of one top-level invocation
    pub timeout: Duration,
    /// Ceiling on guest linear memory (WASM) or address space (scripts)
    pub memory_limit: usize,
    pub isolation: ScriptIsolation,
    pub allow_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from(&SandboxSettings::default())
    }
}

impl From<&SandboxSettings> for SandboxConfig {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            memory_limit: settings.memory_limit_bytes(),
            isolation: settings.script_isolation.clone(),
            allow_network: settings.allow_network,
        }
    }
}

/// Route for nested calls made from inside a running skill
pub trait SkillInvoker: Send + Sync {
    fn invoke(&self, name: &str, args: Value, ctx: &CallContext) -> crate::error::Result<Value>;
}

/// A skill's loaded execution unit
pub enum Callable {
    Wasm(WasmCallable),
    Script(ScriptCallable),
}

impl Callable {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Wasm(_) => "wasm",
            Self::Script(_) => "script",
        }
    }
}

// ==================== Epoch Ticker ====================

/// Background thread advancing the engine epoch so deadlines fire even
/// when a guest never calls back into the host
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("skilld-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ==================== Sandbox ====================

struct SandboxInner {
    engine: Engine,
    linker: Linker<SkillState>,
    config: SandboxConfig,
    _ticker: EpochTicker,
}

/// Loads skill code into isolated units and executes them under the
/// configured time and memory ceilings
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        let engine = Engine::new(&wasm_config)?;

        let mut linker: Linker<SkillState> = Linker::new(&engine);
        host::add_to_linker(&mut linker)?;

        if config.isolation != ScriptIsolation::None && !config.isolation.available() {
            warn!(
                isolation = ?config.isolation,
                "Script isolation tool not found; script skills will fail to start"
            );
        }

        let ticker = EpochTicker::start(engine.clone())?;
        debug!(
            timeout_ms = config.timeout.as_millis() as u64,
            memory_limit = config.memory_limit,
            "Sandbox ready"
        );

        Ok(Self {
            inner: Arc::new(SandboxInner {
                engine,
                linker,
                config,
                _ticker: ticker,
            }),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Turn `(metadata, code)` into a callable unit, or explain why not
    pub fn load(&self, metadata: &SkillMetadata, code: &str) -> crate::error::Result<Callable> {
        match &metadata.runtime {
            SkillRuntime::Wasm => {
                let wasm =
                    WasmCallable::compile(&self.inner.engine, &self.inner.linker, metadata, code)?;
                debug!(skill = %metadata.name, entry = wasm.entry(), "Module compiled");
                Ok(Callable::Wasm(wasm))
            }
            SkillRuntime::Script { interpreter } => {
                ScriptCallable::prepare(metadata, interpreter, code).map(Callable::Script)
            }
        }
    }

    /// Run `skill` inside the frame `ctx` (which already lists the skill)
    pub fn execute(
        &self,
        skill: &Skill,
        args: Value,
        ctx: CallContext,
        invoker: Arc<dyn SkillInvoker>,
    ) -> crate::error::Result<Value> {
        let ctx = ctx.ensure_timeout(self.inner.config.timeout);
        ctx.check()?;

        let result = match &skill.callable {
            Callable::Wasm(wasm) => wasm.execute(
                &self.inner.engine,
                &self.inner.config,
                skill.name(),
                args,
                ctx,
                invoker,
            ),
            Callable::Script(script) => {
                script.execute(&self.inner.config, skill.name(), args, ctx, invoker.as_ref())
            }
        };

        if let Err(e) = &result {
            debug!(skill = %skill.name(), kind = e.kind(), error = %e, "Skill failed");
        }
        result
    }
}

/// Collapse a wasmtime/anyhow failure into a classified error
pub(crate) fn classify(skill: &str, err: anyhow::Error, budget: Duration) -> SkillError {
    if let Some(classified) = SkillError::from_anyhow(&err) {
        return classified;
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        return match trap {
            wasmtime::Trap::Interrupt => SkillError::Timeout(budget),
            wasmtime::Trap::StackOverflow => {
                SkillError::ResourceExceeded("stack overflow".to_string())
            }
            other => {
                warn!(skill, error = ?err, "Skill trapped");
                SkillError::runtime(skill, other)
            }
        };
    }
    warn!(skill, error = ?err, "Skill failed");
    SkillError::runtime(skill, err.root_cause())
}
