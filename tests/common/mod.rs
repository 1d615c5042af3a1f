//! Common test utilities: WAT skill fixtures and a throwaway runtime
#![allow(dead_code)]

use skilld::runtime::{Sandbox, SandboxConfig};
use skilld::{Composer, InputType, SkillMetadata, SkillRegistry, SkillStore};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// `add(a, b) -> {result: a + b}`
pub const ADD_WAT: &str = r#"
(module
  (import "skill" "arg_i64" (func $arg (param i32 i32) (result i64)))
  (import "skill" "ret_i64" (func $ret (param i32 i32 i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "a")
  (data (i32.const 8) "b")
  (data (i32.const 16) "result")
  (func (export "add")
    (call $ret (i32.const 16) (i32.const 6)
      (i64.add
        (call $arg (i32.const 0) (i32.const 1))
        (call $arg (i32.const 8) (i32.const 1))))))
"#;

/// `double(x)` calls `add(a = x, b = x)` and returns its result
pub const DOUBLE_WAT: &str = r#"
(module
  (import "skill" "arg_i64" (func $arg (param i32 i32) (result i64)))
  (import "skill" "call_arg_i64" (func $stage (param i32 i32 i64)))
  (import "skill" "call" (func $call (param i32 i32)))
  (import "skill" "result_i64" (func $result (param i32 i32) (result i64)))
  (import "skill" "ret_i64" (func $ret (param i32 i32 i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "x")
  (data (i32.const 8) "a")
  (data (i32.const 16) "b")
  (data (i32.const 24) "add")
  (data (i32.const 32) "result")
  (func (export "double")
    (call $stage (i32.const 8) (i32.const 1) (call $arg (i32.const 0) (i32.const 1)))
    (call $stage (i32.const 16) (i32.const 1) (call $arg (i32.const 0) (i32.const 1)))
    (call $call (i32.const 24) (i32.const 3))
    (call $ret (i32.const 32) (i32.const 6)
      (call $result (i32.const 32) (i32.const 6)))))
"#;

/// Returns `{ok: 1}` without calling anything
pub const LEAF_WAT: &str = r#"
(module
  (import "skill" "ret_i64" (func $ret (param i32 i32 i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "ok")
  (func (export "leaf")
    (call $ret (i32.const 0) (i32.const 2) (i64.const 1))))
"#;

/// Never yields back to the host
pub const SPIN_WAT: &str = r#"
(module
  (func (export "spin")
    (loop $forever
      (br $forever))))
"#;

/// Asks for 256 MiB of linear memory
pub const GROW_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "grow") (result i32)
    (memory.grow (i32.const 4096))))
"#;

/// Raises "boom" through the host
pub const FAIL_WAT: &str = r#"
(module
  (import "skill" "fail" (func $fail (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "boom")
  (func (export "explode")
    (call $fail (i32.const 0) (i32.const 4))))
"#;

/// Hits an `unreachable` instruction
pub const TRAP_WAT: &str = r#"
(module
  (func (export "crash")
    unreachable))
"#;

/// Typed entry: parameters bound to inputs `a`, `b` in order
pub const TYPED_ADD_WAT: &str = r#"
(module
  (func (export "typed_add") (param i64 i64) (result i64)
    (i64.add (local.get 0) (local.get 1))))
"#;

/// WASI command writing "hello" to stdout
pub const HELLO_WASI_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 6))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

/// Only private exports
pub const NO_EXPORT_WAT: &str = r#"
(module
  (func $hidden (result i32) (i32.const 1)))
"#;

/// Imports a host function that does not exist
pub const BAD_IMPORT_WAT: &str = r#"
(module
  (import "skill" "launch_missiles" (func $nope))
  (func (export "attack") (call $nope)))
"#;

/// A skill named `name` that calls `target` with its own arguments and
/// returns whatever `target` returned
pub fn forward_wat(name: &str, target: &str) -> String {
    format!(
        r#"
(module
  (import "skill" "input_len" (func $input_len (result i32)))
  (import "skill" "input_read" (func $input_read (param i32)))
  (import "skill" "call_json" (func $call_json (param i32 i32 i32 i32) (result i32)))
  (import "skill" "result_read" (func $result_read (param i32)))
  (import "skill" "ret_json" (func $ret_json (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{target}")
  (func (export "{name}") (local $in i32) (local $out i32)
    (local.set $in (call $input_len))
    (call $input_read (i32.const 1024))
    (local.set $out
      (call $call_json (i32.const 0) (i32.const {len}) (i32.const 1024) (local.get $in)))
    (call $result_read (i32.const 32768))
    (call $ret_json (i32.const 32768) (local.get $out))))
"#,
        name = name,
        target = target,
        len = target.len()
    )
}

pub fn metadata(name: &str, inputs: &[(&str, InputType)]) -> SkillMetadata {
    let mut meta = SkillMetadata::new(name, format!("{} skill", name));
    for (input, ty) in inputs {
        meta.inputs.insert(*input, *ty);
    }
    meta
}

/// Registry + composer over an on-disk store in a temp dir
pub struct TestRuntime {
    pub dir: TempDir,
    pub registry: SkillRegistry,
    pub composer: Composer,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_config(SandboxConfig::default(), 5)
    }

    pub fn with_config(config: SandboxConfig, max_depth: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (registry, composer) = open_runtime(dir.path(), config, max_depth);
        Self {
            dir,
            registry,
            composer,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_config(
            SandboxConfig {
                timeout,
                ..SandboxConfig::default()
            },
            5,
        )
    }

    pub fn register(&self, name: &str, code: &str, inputs: &[(&str, InputType)]) {
        self.registry
            .register(metadata(name, inputs), code.to_string())
            .unwrap_or_else(|e| panic!("failed to register {}: {}", name, e));
    }

    /// A second registry over the same database, as after a restart
    pub fn reopen(&self) -> (SkillRegistry, Composer) {
        open_runtime(self.dir.path(), SandboxConfig::default(), 5)
    }
}

pub fn open_runtime(
    dir: &Path,
    config: SandboxConfig,
    max_depth: usize,
) -> (SkillRegistry, Composer) {
    let store = SkillStore::open(&dir.join("skills.db")).expect("Failed to open store");
    let sandbox = Sandbox::new(config).expect("Failed to build sandbox");
    let registry = SkillRegistry::new(store, sandbox);
    let composer = Composer::new(registry.clone(), max_depth);
    (registry, composer)
}

/// Register the `add` / `double` pair used throughout the suite
pub fn register_add_and_double(rt: &TestRuntime) {
    rt.register(
        "add",
        ADD_WAT,
        &[("a", InputType::Integer), ("b", InputType::Integer)],
    );
    rt.register("double", DOUBLE_WAT, &[("x", InputType::Integer)]);
}

pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
