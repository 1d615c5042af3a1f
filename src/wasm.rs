//! WebAssembly skills, run in-process with per-call stores.

use serde_json::Value;
use std::sync::Arc;
use wasmtime::{
    Engine, ExternType, InstancePre, Linker, Module, Store, UpdateDeadline, Val, ValType,
};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::WasiCtxBuilder;

use crate::composer::CallContext;
use crate::error::{Result, SkillError};
use crate::host::{HostState, SkillLimiter, SkillState};
use crate::registry::SkillMetadata;
use crate::runtime::{classify, SandboxConfig, SkillInvoker};

/// Captured guest stdout/stderr ceiling
const PIPE_CAPACITY: usize = 64 * 1024;

/// Scalar parameter/result kinds an entry export may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    I32,
    I64,
    F32,
    F64,
}

impl Scalar {
    fn from_val_type(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(Self::I32),
            ValType::I64 => Some(Self::I64),
            ValType::F32 => Some(Self::F32),
            ValType::F64 => Some(Self::F64),
            _ => None,
        }
    }

    fn zero(self) -> Val {
        match self {
            Self::I32 => Val::I32(0),
            Self::I64 => Val::I64(0),
            Self::F32 => Val::F32(0),
            Self::F64 => Val::F64(0),
        }
    }

    fn to_val(self, value: &Value) -> Option<Val> {
        match self {
            Self::I32 => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Val::I32),
            Self::I64 => value.as_i64().map(Val::I64),
            Self::F32 => value.as_f64().map(|v| Val::F32((v as f32).to_bits())),
            Self::F64 => value.as_f64().map(|v| Val::F64(v.to_bits())),
        }
    }
}

fn val_to_json(val: &Val) -> Value {
    let float = |v: f64| {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    };
    match val {
        Val::I32(v) => Value::from(*v),
        Val::I64(v) => Value::from(*v),
        Val::F32(bits) => float(f32::from_bits(*bits) as f64),
        Val::F64(bits) => float(f64::from_bits(*bits)),
        _ => Value::Null,
    }
}

/// A compiled module with its imports resolved and its entry export chosen
pub struct WasmCallable {
    pre: InstancePre<SkillState>,
    entry: String,
    params: Vec<(String, Scalar)>,
    results: Vec<Scalar>,
}

impl WasmCallable {
    /// Compile WAT `code` and pick the entry export: the
    /// function named after the skill, else the first exported function not
    /// starting with `_`, else a WASI `_start`.
    pub fn compile(
        engine: &Engine,
        linker: &Linker<SkillState>,
        metadata: &SkillMetadata,
        code: &str,
    ) -> Result<Self> {
        let name = &metadata.name;
        let module = Module::new(engine, code.as_bytes())
            .map_err(|e| SkillError::registration(name, format!("invalid module: {}", e)))?;

        let functions: Vec<(String, wasmtime::FuncType)> = module
            .exports()
            .filter_map(|export| match export.ty() {
                ExternType::Func(ty) => Some((export.name().to_string(), ty)),
                _ => None,
            })
            .collect();

        let (entry, ty) = functions
            .iter()
            .find(|(export, _)| export == name)
            .or_else(|| functions.iter().find(|(export, _)| !export.starts_with('_')))
            .or_else(|| functions.iter().find(|(export, _)| export == "_start"))
            .cloned()
            .ok_or_else(|| SkillError::registration(name, "module exports no callable function"))?;

        let param_types: Vec<Scalar> = ty
            .params()
            .map(|p| Scalar::from_val_type(&p))
            .collect::<Option<_>>()
            .ok_or_else(|| {
                SkillError::registration(name, format!("entry '{}' takes a non-scalar parameter", entry))
            })?;
        if !param_types.is_empty() && param_types.len() != metadata.inputs.len() {
            return Err(SkillError::registration(
                name,
                format!(
                    "entry '{}' takes {} parameters but {} inputs are declared",
                    entry,
                    param_types.len(),
                    metadata.inputs.len()
                ),
            ));
        }
        let params = metadata
            .inputs
            .names()
            .map(str::to_string)
            .zip(param_types)
            .collect();

        let results = ty
            .results()
            .map(|r| Scalar::from_val_type(&r))
            .collect::<Option<_>>()
            .ok_or_else(|| {
                SkillError::registration(name, format!("entry '{}' returns a non-scalar value", entry))
            })?;

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| SkillError::registration(name, format!("unresolved import: {}", e)))?;

        Ok(Self {
            pre,
            entry,
            params,
            results,
        })
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn execute(
        &self,
        engine: &Engine,
        config: &SandboxConfig,
        skill: &str,
        args: Value,
        ctx: CallContext,
        invoker: Arc<dyn SkillInvoker>,
    ) -> Result<Value> {
        let budget = ctx.budget().unwrap_or(config.timeout);

        let mut params = Vec::with_capacity(self.params.len());
        for (input, scalar) in &self.params {
            let val = args
                .get(input)
                .and_then(|v| scalar.to_val(v))
                .ok_or_else(|| {
                    SkillError::runtime(skill, format!("argument '{}' is missing or not a number", input))
                })?;
            params.push(val);
        }

        let stdout = MemoryOutputPipe::new(PIPE_CAPACITY);
        let stderr = MemoryOutputPipe::new(PIPE_CAPACITY);
        let wasi = WasiCtxBuilder::new()
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .build_p1();

        let state = SkillState {
            wasi,
            limiter: SkillLimiter::new(config.memory_limit),
            host: HostState::new(skill, args, ctx, invoker),
        };
        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.limiter);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |store| {
            store.data().host.context().check()?;
            Ok(UpdateDeadline::Continue(1))
        });

        let mut results: Vec<Val> = self.results.iter().map(|r| r.zero()).collect();
        let outcome = self
            .pre
            .instantiate(&mut store)
            .and_then(|instance| {
                let func = instance
                    .get_func(&mut store, &self.entry)
                    .ok_or_else(|| anyhow::anyhow!("entry '{}' disappeared", self.entry))?;
                func.call(&mut store, &params, &mut results)
            });

        let stderr_text = String::from_utf8_lossy(&stderr.contents()).into_owned();
        if !stderr_text.trim().is_empty() {
            tracing::debug!(skill, stderr = %stderr_text.trim_end(), "Guest stderr");
        }

        if let Err(err) = outcome {
            let clean_exit = err
                .downcast_ref::<wasmtime_wasi::I32Exit>()
                .is_some_and(|exit| exit.0 == 0);
            if !clean_exit {
                return Err(classify(skill, err, budget));
            }
        }

        if let Some(output) = store.data_mut().host.take_output() {
            return Ok(output);
        }
        match results.len() {
            0 => {}
            1 => return Ok(val_to_json(&results[0])),
            _ => return Ok(Value::Array(results.iter().map(val_to_json).collect())),
        }
        let text = String::from_utf8_lossy(&stdout.contents()).into_owned();
        if text.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(Value::String(text))
        }
    }
}
