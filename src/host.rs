//! Host side of the WASM guest ABI.
//!
//! Guests see a single import module, `skill`. Pointers and lengths are
//! `i32` offsets into the guest's exported `memory`. A host function that
//! returns an error traps the guest; a [`SkillError`] carried in that error
//! survives the trap and becomes the classified result of the call.

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use wasmtime::{Caller, Extern, Linker, Memory, ResourceLimiter};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::composer::CallContext;
use crate::error::SkillError;
use crate::runtime::SkillInvoker;

/// Import module name guests link against
pub const MODULE: &str = "skill";

/// Per-execution store data
pub struct SkillState {
    pub wasi: WasiP1Ctx,
    pub limiter: SkillLimiter,
    pub host: HostState,
}

/// Caps linear memory growth of one execution
pub struct SkillLimiter {
    memory_limit: usize,
}

impl SkillLimiter {
    pub fn new(memory_limit: usize) -> Self {
        Self { memory_limit }
    }
}

impl ResourceLimiter for SkillLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        if desired > self.memory_limit {
            return Err(SkillError::ResourceExceeded(format!(
                "memory growth from {} to {} bytes exceeds the {} byte limit",
                current, desired, self.memory_limit
            ))
            .into());
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        Ok(maximum.map_or(true, |max| desired <= max))
    }
}

/// State the `skill.*` imports operate on
pub struct HostState {
    skill: String,
    args: Value,
    output: Option<Value>,
    staged: Map<String, Value>,
    last_result: Value,
    context: CallContext,
    invoker: Arc<dyn SkillInvoker>,
}

impl HostState {
    pub fn new(
        skill: &str,
        args: Value,
        context: CallContext,
        invoker: Arc<dyn SkillInvoker>,
    ) -> Self {
        Self {
            skill: skill.to_string(),
            args,
            output: None,
            staged: Map::new(),
            last_result: Value::Null,
            context,
            invoker,
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Result set through `ret_*`, if the guest set one
    pub fn take_output(&mut self) -> Option<Value> {
        self.output.take()
    }

    fn set_field(&mut self, key: String, value: Value) {
        let output = self.output.get_or_insert_with(|| Value::Object(Map::new()));
        if !output.is_object() {
            *output = Value::Object(Map::new());
        }
        if let Value::Object(map) = output {
            map.insert(key, value);
        }
    }

    /// Run a nested call with the staged arguments (or `args`)
    fn call(&mut self, name: &str, args: Option<Value>) -> Result<()> {
        let args = args.unwrap_or_else(|| Value::Object(std::mem::take(&mut self.staged)));
        self.staged.clear();
        let invoker = self.invoker.clone();
        let result = invoker.invoke(name, args, &self.context)?;
        self.last_result = result;
        Ok(())
    }
}

fn number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().map(|v| v as i64))
        .or_else(|| value.as_f64().map(|v| v as i64))
}

fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ==================== Guest memory ====================

fn memory(caller: &mut Caller<'_, SkillState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export a 'memory'"))
}

fn span(ptr: i32, len: i32) -> Result<(usize, usize)> {
    let len = usize::try_from(len).context("negative length")?;
    Ok((ptr as u32 as usize, len))
}

fn read_bytes(caller: &mut Caller<'_, SkillState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let (offset, len) = span(ptr, len)?;
    let memory = memory(caller)?;
    let mut buf = vec![0u8; len];
    memory
        .read(&*caller, offset, &mut buf)
        .context("guest pointer out of bounds")?;
    Ok(buf)
}

fn read_str(caller: &mut Caller<'_, SkillState>, ptr: i32, len: i32) -> Result<String> {
    let bytes = read_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).context("guest string is not UTF-8")
}

fn read_json(caller: &mut Caller<'_, SkillState>, ptr: i32, len: i32) -> Result<Value> {
    let bytes = read_bytes(caller, ptr, len)?;
    serde_json::from_slice(&bytes).context("guest JSON is malformed")
}

fn write_bytes(caller: &mut Caller<'_, SkillState>, ptr: i32, bytes: &[u8]) -> Result<()> {
    let memory = memory(caller)?;
    memory
        .write(&mut *caller, ptr as u32 as usize, bytes)
        .context("guest pointer out of bounds")
}

fn json_len(value: &Value) -> Result<i32> {
    let len = serde_json::to_vec(value)?.len();
    i32::try_from(len).context("JSON value too large for guest")
}

fn fail(caller: &Caller<'_, SkillState>, message: impl std::fmt::Display) -> anyhow::Error {
    SkillError::runtime(&caller.data().host.skill, message).into()
}

// ==================== Imports ====================

pub fn add_to_linker(linker: &mut Linker<SkillState>) -> Result<()> {
    wasmtime_wasi::preview1::add_to_linker_sync(linker, |s: &mut SkillState| &mut s.wasi)?;

    // Arguments
    linker.func_wrap(
        MODULE,
        "arg_i64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32| -> Result<i64> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            match caller.data().host.args.get(&key).and_then(integer) {
                Some(v) => Ok(v),
                None => Err(fail(&caller, format!("missing integer argument '{}'", key))),
            }
        },
    )?;
    linker.func_wrap(
        MODULE,
        "arg_f64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32| -> Result<f64> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            match caller.data().host.args.get(&key).and_then(number) {
                Some(v) => Ok(v),
                None => Err(fail(&caller, format!("missing numeric argument '{}'", key))),
            }
        },
    )?;
    linker.func_wrap(
        MODULE,
        "input_len",
        |caller: Caller<'_, SkillState>| -> Result<i32> { json_len(&caller.data().host.args) },
    )?;
    linker.func_wrap(
        MODULE,
        "input_read",
        |mut caller: Caller<'_, SkillState>, ptr: i32| -> Result<()> {
            let bytes = serde_json::to_vec(&caller.data().host.args)?;
            write_bytes(&mut caller, ptr, &bytes)
        },
    )?;

    // Results
    linker.func_wrap(
        MODULE,
        "ret_i64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32, v: i64| -> Result<()> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            caller.data_mut().host.set_field(key, Value::from(v));
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "ret_f64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32, v: f64| -> Result<()> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            caller.data_mut().host.set_field(key, float_value(v));
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "ret_str",
        |mut caller: Caller<'_, SkillState>,
         key_ptr: i32,
         key_len: i32,
         val_ptr: i32,
         val_len: i32|
         -> Result<()> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            let value = read_str(&mut caller, val_ptr, val_len)?;
            caller.data_mut().host.set_field(key, Value::String(value));
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "ret_json",
        |mut caller: Caller<'_, SkillState>, ptr: i32, len: i32| -> Result<()> {
            let value = read_json(&mut caller, ptr, len)?;
            caller.data_mut().host.output = Some(value);
            Ok(())
        },
    )?;

    // Nested calls
    linker.func_wrap(
        MODULE,
        "call_arg_i64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32, v: i64| -> Result<()> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            caller.data_mut().host.staged.insert(key, Value::from(v));
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "call_arg_f64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32, v: f64| -> Result<()> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            caller.data_mut().host.staged.insert(key, float_value(v));
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "call_arg_str",
        |mut caller: Caller<'_, SkillState>,
         key_ptr: i32,
         key_len: i32,
         val_ptr: i32,
         val_len: i32|
         -> Result<()> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            let value = read_str(&mut caller, val_ptr, val_len)?;
            caller
                .data_mut()
                .host
                .staged
                .insert(key, Value::String(value));
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "call",
        |mut caller: Caller<'_, SkillState>, name_ptr: i32, name_len: i32| -> Result<()> {
            let name = read_str(&mut caller, name_ptr, name_len)?;
            caller.data_mut().host.call(&name, None)
        },
    )?;
    linker.func_wrap(
        MODULE,
        "call_json",
        |mut caller: Caller<'_, SkillState>,
         name_ptr: i32,
         name_len: i32,
         args_ptr: i32,
         args_len: i32|
         -> Result<i32> {
            let name = read_str(&mut caller, name_ptr, name_len)?;
            let args = read_json(&mut caller, args_ptr, args_len)?;
            let host = &mut caller.data_mut().host;
            host.call(&name, Some(args))?;
            json_len(&host.last_result)
        },
    )?;
    linker.func_wrap(
        MODULE,
        "result_i64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32| -> Result<i64> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            match caller.data().host.last_result.get(&key).and_then(integer) {
                Some(v) => Ok(v),
                None => Err(fail(
                    &caller,
                    format!("last call result has no integer field '{}'", key),
                )),
            }
        },
    )?;
    linker.func_wrap(
        MODULE,
        "result_f64",
        |mut caller: Caller<'_, SkillState>, key_ptr: i32, key_len: i32| -> Result<f64> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            match caller.data().host.last_result.get(&key).and_then(number) {
                Some(v) => Ok(v),
                None => Err(fail(
                    &caller,
                    format!("last call result has no numeric field '{}'", key),
                )),
            }
        },
    )?;
    linker.func_wrap(
        MODULE,
        "result_len",
        |caller: Caller<'_, SkillState>| -> Result<i32> {
            json_len(&caller.data().host.last_result)
        },
    )?;
    linker.func_wrap(
        MODULE,
        "result_read",
        |mut caller: Caller<'_, SkillState>, ptr: i32| -> Result<()> {
            let bytes = serde_json::to_vec(&caller.data().host.last_result)?;
            write_bytes(&mut caller, ptr, &bytes)
        },
    )?;

    // Diagnostics
    linker.func_wrap(
        MODULE,
        "log",
        |mut caller: Caller<'_, SkillState>, ptr: i32, len: i32| -> Result<()> {
            let message = read_str(&mut caller, ptr, len)?;
            info!(skill = %caller.data().host.skill, "{}", message);
            Ok(())
        },
    )?;
    linker.func_wrap(
        MODULE,
        "fail",
        |mut caller: Caller<'_, SkillState>, ptr: i32, len: i32| -> Result<()> {
            let message = read_str(&mut caller, ptr, len)?;
            Err(fail(&caller, message))
        },
    )?;

    Ok(())
}
