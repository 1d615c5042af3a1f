//! skilld - register, compose and serve sandboxed skills over MCP
//!
//! Skills are WebAssembly modules (run in-process under wasmtime) or
//! scripts (run out-of-process over JSON-RPC). A skill may call other
//! skills; the composer bounds the call chain and rejects cycles. The
//! protocol handler exposes the catalogue as MCP tools over stdio or HTTP.

pub mod composer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod script;
pub mod store;
pub mod transport;
pub mod wasm;

pub use composer::{CallContext, Composer};
pub use config::SkilldConfig;
pub use error::SkillError;
pub use protocol::ProtocolHandler;
pub use registry::{InputType, SkillMetadata, SkillRegistry, SkillRuntime};
pub use runtime::{Sandbox, SandboxConfig};
pub use store::SkillStore;
