//! Skill discovery - load skills dropped into a directory and hot-reload them
//!
//! Layout: one sub-directory per skill holding a `skill.toml` manifest and
//! the source file it names.
//!
//! ```toml
//! description = "Add two integers"
//! source = "add.wat"
//!
//! [inputs]
//! a = "integer"
//! b = "integer"
//! ```

use anyhow::Context;
use notify_debouncer_mini::notify::{self, RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::registry::{InputSpec, SkillMetadata, SkillRegistry, SkillRuntime};

pub const MANIFEST_FILE: &str = "skill.toml";

const SOURCE_EXTENSIONS: &[&str] = &["wat", "py", "js", "rb", "sh"];

fn default_source() -> String {
    "skill.wat".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Contents of `skill.toml`
#[derive(Debug, Deserialize)]
struct SkillManifest {
    /// Defaults to the directory name
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default)]
    runtime: SkillRuntime,
    #[serde(default)]
    inputs: InputSpec,
}

/// Read a skill directory into `(metadata, code)`
pub fn load_skill_dir(dir: &Path) -> anyhow::Result<(SkillMetadata, String)> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("cannot read {}", manifest_path.display()))?;
    let manifest: SkillManifest = toml::from_str(&content)
        .with_context(|| format!("invalid {}", manifest_path.display()))?;

    let name = match manifest.name {
        Some(name) => name,
        None => dir
            .file_name()
            .and_then(|n| n.to_str())
            .context("skill directory has no usable name")?
            .to_string(),
    };

    let source_path = dir.join(&manifest.source);
    if source_path.parent() != Some(dir) {
        anyhow::bail!("source '{}' must be a file inside {}", manifest.source, dir.display());
    }
    let code = std::fs::read_to_string(&source_path)
        .with_context(|| format!("cannot read {}", source_path.display()))?;

    let metadata = SkillMetadata {
        name,
        description: manifest.description,
        version: manifest.version,
        inputs: manifest.inputs,
        runtime: manifest.runtime,
    };
    Ok((metadata, code))
}

/// Something changed under one skill directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoveryEvent {
    /// The directory's manifest or source was written
    Changed(String),
    /// The directory (or its manifest) is gone
    Removed(String),
}

/// Register every skill directory found under `skills_dir`.
/// Returns the directory → skill name mapping of what loaded.
pub fn scan(registry: &SkillRegistry, skills_dir: &Path) -> HashMap<String, String> {
    let mut discovered = HashMap::new();
    let entries = match std::fs::read_dir(skills_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %skills_dir.display(), error = %e, "Cannot scan skills directory");
            return discovered;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(dir_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if !path.is_dir() || is_ignored(&dir_name) || !path.join(MANIFEST_FILE).exists() {
            continue;
        }
        if let Some(name) = install(registry, &path) {
            record(&mut discovered, dir_name, name);
        }
    }

    info!(
        dir = %skills_dir.display(),
        count = discovered.len(),
        "Scanned skills directory"
    );
    discovered
}

fn install(registry: &SkillRegistry, dir: &Path) -> Option<String> {
    let (metadata, code) = match load_skill_dir(dir) {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!(dir = %dir.display(), error = %format!("{:#}", e), "Skipping skill directory");
            return None;
        }
    };
    let name = metadata.name.clone();
    match registry.register(metadata, code) {
        Ok(()) => Some(name),
        Err(e) => {
            warn!(skill = %name, error = %e, "Discovered skill failed to register");
            None
        }
    }
}

/// Map `dir_name` to `name`, returning the name it mapped before. Two
/// directories declaring one name share a single registry entry.
fn record(
    discovered: &mut HashMap<String, String>,
    dir_name: String,
    name: String,
) -> Option<String> {
    if let Some(other) = claimed_elsewhere(discovered, &dir_name, &name) {
        warn!(
            skill = %name,
            dir = %dir_name,
            other_dir = %other,
            "Skill name declared by two directories; the later one wins"
        );
    }
    discovered.insert(dir_name, name)
}

fn claimed_elsewhere<'a>(
    discovered: &'a HashMap<String, String>,
    dir_name: &str,
    name: &str,
) -> Option<&'a str> {
    discovered
        .iter()
        .find(|(dir, claimed)| dir.as_str() != dir_name && claimed.as_str() == name)
        .map(|(dir, _)| dir.as_str())
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

/// Map one file system event to the skill directory it concerns
fn process_event(event: &DebouncedEvent, skills_dir: &Path) -> Option<DiscoveryEvent> {
    let rel_path = event.path.strip_prefix(skills_dir).ok()?;
    let mut components = rel_path.components();
    let dir_name = components.next()?.as_os_str().to_str()?.to_string();
    if is_ignored(&dir_name) {
        return None;
    }

    let skill_dir = skills_dir.join(&dir_name);
    // The directory itself was created or deleted
    if components.next().is_none() {
        return if skill_dir.exists() {
            skill_dir
                .join(MANIFEST_FILE)
                .exists()
                .then(|| DiscoveryEvent::Changed(dir_name))
        } else {
            Some(DiscoveryEvent::Removed(dir_name))
        };
    }

    let file_name = event.path.file_name()?.to_str()?;
    let relevant = file_name == MANIFEST_FILE
        || Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
    if !relevant {
        return None;
    }

    if skill_dir.join(MANIFEST_FILE).exists() {
        Some(DiscoveryEvent::Changed(dir_name))
    } else {
        Some(DiscoveryEvent::Removed(dir_name))
    }
}

/// Running watcher; dropping it stops discovery
pub struct SkillWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    _handle: tokio::task::JoinHandle<()>,
}

/// Watch `skills_dir` and keep the registry in sync with it.
/// `discovered` is the mapping returned by [`scan`].
pub fn watch(
    registry: SkillRegistry,
    skills_dir: PathBuf,
    discovered: HashMap<String, String>,
) -> anyhow::Result<SkillWatcher> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(500), tx)?;
    debouncer
        .watcher()
        .watch(&skills_dir, RecursiveMode::Recursive)?;

    info!(dir = %skills_dir.display(), "Hot reload enabled");

    let handle = tokio::task::spawn_blocking(move || {
        event_loop(rx, registry, skills_dir, discovered)
    });

    Ok(SkillWatcher {
        _debouncer: debouncer,
        _handle: handle,
    })
}

fn event_loop(
    rx: std::sync::mpsc::Receiver<Result<Vec<DebouncedEvent>, notify::Error>>,
    registry: SkillRegistry,
    skills_dir: PathBuf,
    mut discovered: HashMap<String, String>,
) {
    while let Ok(batch) = rx.recv() {
        let events = match batch {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Skill watcher error");
                continue;
            }
        };

        let changes: BTreeSet<DiscoveryEvent> = events
            .iter()
            .filter_map(|event| process_event(event, &skills_dir))
            .collect();
        for change in changes {
            debug!(?change, "Skill directory changed");
            apply(&registry, &skills_dir, &mut discovered, change);
        }
    }
    debug!("Skill watcher stopped");
}

fn apply(
    registry: &SkillRegistry,
    skills_dir: &Path,
    discovered: &mut HashMap<String, String>,
    change: DiscoveryEvent,
) {
    match change {
        DiscoveryEvent::Changed(dir_name) => {
            let Some(name) = install(registry, &skills_dir.join(&dir_name)) else {
                return;
            };
            if let Some(previous) = record(discovered, dir_name.clone(), name.clone()) {
                if previous != name && claimed_elsewhere(discovered, &dir_name, &previous).is_none() {
                    let _ = registry.unregister(&previous);
                }
            }
            info!(skill = %name, "Reloaded skill");
        }
        DiscoveryEvent::Removed(dir_name) => {
            if let Some(name) = discovered.remove(&dir_name) {
                if let Some(other) = claimed_elsewhere(discovered, &dir_name, &name) {
                    debug!(skill = %name, dir = %other, "Skill still provided by another directory");
                    return;
                }
                match registry.unregister(&name) {
                    Ok(()) => info!(skill = %name, "Removed skill"),
                    Err(e) => debug!(skill = %name, error = %e, "Skill already gone"),
                }
            }
        }
    }
}
