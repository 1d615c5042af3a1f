use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::composer::CallContext;
use crate::error::{Result, SkillError};
use crate::registry::SkillMetadata;
use crate::runtime::{SandboxConfig, SkillInvoker};

/// Granularity of deadline and cancellation checks while a script runs
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// ==================== Isolation ====================

/// OS-level wrapper for script processes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScriptIsolation {
    /// Plain child process with an address-space rlimit
    #[default]
    None,
    /// Use bubblewrap (bwrap)
    Bubblewrap,
    /// Use firejail
    Firejail,
    /// Use nsjail (most restrictive)
    Nsjail,
}

impl ScriptIsolation {
    fn program(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Bubblewrap => Some("bwrap"),
            Self::Firejail => Some("firejail"),
            Self::Nsjail => Some("nsjail"),
        }
    }

    /// Whether the wrapper binary can be started
    pub fn available(&self) -> bool {
        match self.program() {
            None => true,
            Some(program) => Command::new(program).arg("--version").output().is_ok(),
        }
    }

    /// Arguments placed before `-- interpreter script`
    pub fn wrapper_args(&self, script_path: &Path, config: &SandboxConfig) -> Vec<String> {
        let memory_bytes = config.memory_limit as u64;
        let time_limit_secs = config.timeout.as_secs().max(1);
        let script_dir = script_path
            .parent()
            .map(|p| p.to_string_lossy().to_string());

        match self {
            Self::None => Vec::new(),
            Self::Bubblewrap => {
                let mut args: Vec<String> = [
                    "--unshare-all",
                    "--die-with-parent",
                    "--ro-bind",
                    "/usr",
                    "/usr",
                    "--ro-bind",
                    "/lib",
                    "/lib",
                    "--ro-bind-try",
                    "/lib64",
                    "/lib64",
                    "--ro-bind",
                    "/bin",
                    "/bin",
                    "--proc",
                    "/proc",
                    "--dev",
                    "/dev",
                    "--tmpfs",
                    "/tmp",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                if let Some(dir) = script_dir {
                    args.push("--ro-bind".to_string());
                    args.push(dir.clone());
                    args.push(dir);
                }
                if config.allow_network {
                    args.push("--share-net".to_string());
                }
                args
            }
            Self::Firejail => {
                let mut args: Vec<String> = [
                    "--quiet",
                    "--private-tmp",
                    "--nogroups",
                    "--nonewprivs",
                    "--noroot",
                    "--seccomp",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                if !config.allow_network {
                    args.push("--net=none".to_string());
                }
                if let Some(dir) = script_dir {
                    args.push(format!("--whitelist={}", dir));
                }
                if memory_bytes > 0 {
                    args.push(format!("--rlimit-as={}", memory_bytes));
                }
                args
            }
            Self::Nsjail => {
                let mut args: Vec<String> = [
                    "--mode", "o", "--quiet", "-R", "/usr", "-R", "/lib", "-R", "/bin",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                if let Some(dir) = script_dir {
                    args.push("-R".to_string());
                    args.push(dir);
                }
                if config.allow_network {
                    args.push("--disable_clone_newnet".to_string());
                }
                if memory_bytes > 0 {
                    args.push("--rlimit_as".to_string());
                    args.push((memory_bytes / (1024 * 1024)).max(1).to_string());
                }
                args.push("--time_limit".to_string());
                args.push(time_limit_secs.to_string());
                args
            }
        }
    }
}

// ==================== Script skills ====================

/// Script source materialised in a private temporary file
pub struct ScriptCallable {
    interpreter: String,
    file: NamedTempFile,
}

impl ScriptCallable {
    pub fn prepare(metadata: &SkillMetadata, interpreter: &str, code: &str) -> Result<Self> {
        let name = &metadata.name;
        if interpreter.trim().is_empty() {
            return Err(SkillError::registration(name, "script runtime needs an interpreter"));
        }
        if code.trim().is_empty() {
            return Err(SkillError::registration(name, "script is empty"));
        }

        let suffix = match interpreter {
            "python3" | "python" => ".py",
            "node" | "nodejs" => ".js",
            "ruby" => ".rb",
            _ => "",
        };
        let mut file = tempfile::Builder::new()
            .prefix(&format!("skilld-{}-", name))
            .suffix(suffix)
            .tempfile()
            .map_err(|e| SkillError::registration(name, format!("cannot stage script: {}", e)))?;
        file.write_all(code.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| SkillError::registration(name, format!("cannot stage script: {}", e)))?;

        Ok(Self {
            interpreter: interpreter.to_string(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn command(&self, config: &SandboxConfig) -> Command {
        let path = self.path();
        let mut inner: Vec<String> = Vec::new();

        // ulimit keeps the plain and bwrap modes under the memory ceiling
        if matches!(config.isolation, ScriptIsolation::None | ScriptIsolation::Bubblewrap)
            && cfg!(unix)
            && config.memory_limit > 0
        {
            let kib = (config.memory_limit / 1024).max(1);
            inner.extend([
                "sh".to_string(),
                "-c".to_string(),
                format!("ulimit -v {} 2>/dev/null; exec \"$@\"", kib),
                "sh".to_string(),
            ]);
        }
        inner.push(self.interpreter.clone());
        inner.push(path.to_string_lossy().to_string());

        let mut cmd = match config.isolation.program() {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.args(config.isolation.wrapper_args(path, config));
                cmd.arg("--");
                cmd.args(&inner);
                cmd
            }
            None => {
                let mut cmd = Command::new(&inner[0]);
                cmd.args(&inner[1..]);
                cmd
            }
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    pub fn execute(
        &self,
        config: &SandboxConfig,
        skill: &str,
        args: Value,
        ctx: CallContext,
        invoker: &dyn SkillInvoker,
    ) -> Result<Value> {
        let mut child = self
            .command(config)
            .spawn()
            .map_err(|e| SkillError::runtime(skill, format!("failed to start script: {}", e)))?;

        let run = ScriptRun {
            skill,
            args: &args,
            ctx: &ctx,
            invoker,
        };
        let outcome = run.drive(&mut child);
        if outcome.is_err() {
            let _ = child.kill();
        }
        let _ = child.wait();
        outcome
    }
}

/// Messages a script may write to stdout
#[derive(Debug, Deserialize)]
struct ScriptMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ScriptError>,
}

impl ScriptMessage {
    /// Any other JSON a script prints is its output, not protocol traffic
    fn parse(line: &str) -> Option<Self> {
        let message: Self = serde_json::from_str(line).ok()?;
        let is_rpc = message.jsonrpc.as_deref() == Some("2.0")
            && (message.method.is_some() || message.result.is_some() || message.error.is_some());
        is_rpc.then_some(message)
    }
}

/// Keeps an explicit `"result": null` distinct from a missing result
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct ScriptError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogParams {
    #[serde(default)]
    level: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CallSkillParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

struct ScriptRun<'a> {
    skill: &'a str,
    args: &'a Value,
    ctx: &'a CallContext,
    invoker: &'a dyn SkillInvoker,
}

impl ScriptRun<'_> {
    fn drive(&self, child: &mut Child) -> Result<Value> {
        let skill = self.skill;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SkillError::runtime(skill, "script stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SkillError::runtime(skill, "script stdout unavailable"))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        let stderr_reader = stderr.map(|mut stderr| {
            std::thread::spawn(move || {
                let mut content = String::new();
                let _ = stderr.read_to_string(&mut content);
                content
            })
        });

        let request = json!({
            "jsonrpc": "2.0",
            "method": "execute",
            "params": {
                "arguments": self.arguments(),
                "context": {
                    "skill": skill,
                    "stack": self.ctx.stack(),
                    "max_depth": self.ctx.max_depth(),
                }
            },
            "id": 1
        });
        self.send(&mut stdin, &request)?;

        let mut final_result: Option<Value> = None;
        let mut final_error: Option<String> = None;
        let mut plain_output: Option<String> = None;

        while final_result.is_none() && final_error.is_none() {
            self.ctx.check()?;
            let line = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!(skill, line = %line, "Script output line");

            let Some(message) = ScriptMessage::parse(&line) else {
                let output = plain_output.get_or_insert_with(String::new);
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&line);
                continue;
            };

            match message.method.as_deref() {
                Some("log") | Some("logging/message") => self.log(message.params),
                Some("call_skill") => {
                    let response = self.call_skill(message.params, message.id)?;
                    self.send(&mut stdin, &response)?;
                }
                Some(other) => debug!(skill, method = other, "Ignoring script notification"),
                None => {
                    if let Some(err) = message.error {
                        debug!(skill, code = err.code, "Script reported an error");
                        final_error = Some(err.message);
                    } else {
                        final_result = Some(message.result.unwrap_or(Value::Null));
                    }
                }
            }
        }
        drop(stdin);

        let status = self.wait(child)?;
        let stderr_text = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !stderr_text.trim().is_empty() {
            debug!(skill, stderr = %stderr_text.trim_end(), "Script stderr");
        }

        let exhausted = |text: &str| text.contains("MemoryError") || text.contains("out of memory");
        if let Some(message) = final_error {
            if exhausted(&message) {
                return Err(SkillError::ResourceExceeded(message));
            }
            return Err(SkillError::runtime(skill, message));
        }
        if let Some(result) = final_result {
            return Ok(result);
        }
        if exhausted(&stderr_text) {
            return Err(SkillError::ResourceExceeded(format!(
                "script '{}' ran out of memory",
                skill
            )));
        }
        match status {
            Some(status) if !status.success() => {
                warn!(skill, %status, stderr = %stderr_text.trim_end(), "Script failed");
                let reason = stderr_text
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("script exited with {}", status));
                Err(SkillError::runtime(skill, reason))
            }
            _ => Ok(plain_output.map(Value::String).unwrap_or(Value::Null)),
        }
    }

    /// MCP clients sometimes pass arguments as stringified JSON
    fn arguments(&self) -> Value {
        match self.args {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| self.args.clone()),
            other => other.clone(),
        }
    }

    fn send(&self, stdin: &mut ChildStdin, message: &Value) -> Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| SkillError::runtime(self.skill, format!("script closed its input: {}", e)))
    }

    fn log(&self, params: Option<Value>) {
        let Some(entry) = params.and_then(|p| serde_json::from_value::<LogParams>(p).ok()) else {
            return;
        };
        let skill = self.skill;
        match entry.level.to_ascii_lowercase().as_str() {
            "error" | "critical" => error!(skill, "{}", entry.message),
            "warn" | "warning" => warn!(skill, "{}", entry.message),
            "debug" | "trace" => debug!(skill, "{}", entry.message),
            _ => info!(skill, "{}", entry.message),
        }
    }

    /// Run a nested call on behalf of the script; failures abort the script
    fn call_skill(&self, params: Option<Value>, id: Option<Value>) -> Result<Value> {
        let params: CallSkillParams = params
            .and_then(|p| serde_json::from_value(p).ok())
            .ok_or_else(|| SkillError::runtime(self.skill, "call_skill needs a 'name'"))?;
        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let result = self.invoker.invoke(&params.name, arguments, self.ctx)?;
        Ok(json!({"jsonrpc": "2.0", "result": result, "id": id.unwrap_or(Value::Null)}))
    }

    /// Wait for exit within the remaining budget
    fn wait(&self, child: &mut Child) -> Result<Option<std::process::ExitStatus>> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {}
                Err(_) => return Ok(None),
            }
            self.ctx.check()?;
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
