use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{Result, SkillError};
use crate::runtime::{Callable, Sandbox};
use crate::store::SkillStore;

/// Longest accepted skill name
pub const MAX_NAME_LEN: usize = 64;

/// Type tag of one declared skill input
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    #[default]
    Any,
}

impl InputType {
    /// JSON Schema fragment for this input. `any` accepts every value.
    pub fn json_schema(self) -> Value {
        match self {
            Self::String => json!({"type": "string"}),
            Self::Number => json!({"type": "number"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Any => json!({}),
        }
    }
}

/// Declared inputs in declaration order
///
/// Serialized as a plain map (`{"a": "integer", "b": "integer"}`); the
/// custom (de)serializers keep the entries in the order they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSpec(Vec<(String, InputType)>);

impl InputSpec {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, InputType)>,
        K: Into<String>,
    {
        let mut spec = Self::default();
        for (name, ty) in pairs {
            spec.insert(name, ty);
        }
        spec
    }

    /// Add or retype an input; a retyped input keeps its position
    pub fn insert(&mut self, name: impl Into<String>, ty: InputType) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = ty,
            None => self.0.push((name, ty)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, InputType)> {
        self.0.iter().map(|(n, t)| (n.as_str(), *t))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for InputSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, ty) in &self.0 {
            map.serialize_entry(name, ty)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for InputSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct InputSpecVisitor;

        impl<'de> Visitor<'de> for InputSpecVisitor {
            type Value = InputSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of input name to type tag")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<InputSpec, A::Error> {
                let mut spec = InputSpec::default();
                while let Some((name, ty)) = access.next_entry::<String, InputType>()? {
                    spec.insert(name, ty);
                }
                Ok(spec)
            }
        }

        deserializer.deserialize_map(InputSpecVisitor)
    }
}

/// How a skill's code is executed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SkillRuntime {
    /// WebAssembly module in text format, run in-process
    #[default]
    Wasm,
    /// Script run out-of-process by `interpreter`, speaking JSON-RPC 2.0
    Script { interpreter: String },
}

fn default_version() -> String {
    "0.1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub inputs: InputSpec,
    #[serde(default)]
    pub runtime: SkillRuntime,
}

impl SkillMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: default_version(),
            inputs: InputSpec::default(),
            runtime: SkillRuntime::Wasm,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, ty: InputType) -> Self {
        self.inputs.insert(name, ty);
        self
    }

    pub fn with_runtime(mut self, runtime: SkillRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Object schema over the declared inputs; every input is required
    pub fn input_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .inputs
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.json_schema()))
            .collect();
        let required: Vec<&str> = self.inputs.names().collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Names are path- and log-safe identifiers
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(SkillError::registration(
            name,
            format!("name must be 1-{} characters", MAX_NAME_LEN),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SkillError::registration(
            name,
            "name may only contain ASCII letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// A loaded skill: its metadata, source and compiled callable
pub struct Skill {
    pub metadata: SkillMetadata,
    pub code: String,
    pub callable: Callable,
}

impl Skill {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl fmt::Debug for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skill")
            .field("metadata", &self.metadata)
            .field("callable", &self.callable.kind())
            .finish()
    }
}

/// Catalogue change, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    Registered(String),
    Unregistered(String),
}

#[derive(Clone)]
pub struct SkillRegistry {
    skills: Arc<RwLock<HashMap<String, Arc<Skill>>>>,
    store: SkillStore,
    sandbox: Sandbox,
    events: broadcast::Sender<CatalogEvent>,
}

impl SkillRegistry {
    pub fn new(store: SkillStore, sandbox: Sandbox) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            skills: Arc::new(RwLock::new(HashMap::new())),
            store,
            sandbox,
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Skill>>> {
        self.skills.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Skill>>> {
        self.skills.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-load every persisted skill without writing it back.
    /// Rows that fail to load are logged and skipped.
    pub fn load_persisted(&self) -> Result<usize> {
        let mut loaded = 0;
        for row in self.store.load_all()? {
            let stored = match row {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable persisted skill");
                    continue;
                }
            };
            let name = stored.metadata.name.clone();
            match self.sandbox.load(&stored.metadata, &stored.code) {
                Ok(callable) => {
                    let skill = Arc::new(Skill {
                        metadata: stored.metadata,
                        code: stored.code,
                        callable,
                    });
                    self.write().insert(name, skill);
                    loaded += 1;
                }
                Err(e) => warn!(skill = %name, error = %e, "Skipping persisted skill that failed to load"),
            }
        }

        let skills = self.read();
        let wasm = skills
            .values()
            .filter(|s| s.metadata.runtime == SkillRuntime::Wasm)
            .count();
        info!(
            total = skills.len(),
            wasm,
            script = skills.len() - wasm,
            "Loaded persisted skills"
        );
        Ok(loaded)
    }

    /// Compile, persist and install a skill, replacing any prior entry.
    /// On failure the prior entry (if any) stays installed.
    pub fn register(&self, metadata: SkillMetadata, code: String) -> Result<()> {
        validate_name(&metadata.name)?;
        let callable = self.sandbox.load(&metadata, &code)?;
        let name = metadata.name.clone();
        let skill = Arc::new(Skill {
            metadata,
            code,
            callable,
        });

        let previous = {
            let mut skills = self.write();
            self.store
                .save(&skill.metadata, &skill.code)
                .map_err(|e| SkillError::registration(&name, e))?;
            skills.insert(name.clone(), skill)
        };
        // In-flight executions may still hold the old unit
        drop(previous);

        info!(skill = %name, "Registered skill");
        let _ = self.events.send(CatalogEvent::Registered(name));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let removed = {
            let mut skills = self.write();
            if !skills.contains_key(name) {
                return Err(SkillError::NotFound(name.to_string()));
            }
            self.store.delete(name)?;
            skills.remove(name)
        };
        drop(removed);

        info!(skill = %name, "Unregistered skill");
        let _ = self.events.send(CatalogEvent::Unregistered(name.to_string()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Skill>> {
        self.read().get(name).cloned()
    }

    pub fn get_code(&self, name: &str) -> Result<String> {
        self.get(name)
            .map(|skill| skill.code.clone())
            .ok_or_else(|| SkillError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<SkillMetadata> {
        self.read().values().map(|s| s.metadata.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn store(&self) -> &SkillStore {
        &self.store
    }
}
