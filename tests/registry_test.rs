//! Tests for skill registration, persistence and reload

mod common;

use common::*;
use serde_json::json;
use skilld::registry::CatalogEvent;
use skilld::{InputType, SkillError, SkillMetadata};
use std::collections::HashSet;

#[test]
fn test_register_and_get_code_round_trip() {
    let rt = TestRuntime::new();
    rt.register("add", ADD_WAT, &[("a", InputType::Integer), ("b", InputType::Integer)]);

    assert_eq!(rt.registry.get_code("add").unwrap(), ADD_WAT);
    let skill = rt.registry.get("add").unwrap();
    assert_eq!(skill.metadata.version, "0.1.0");
    assert_eq!(skill.callable.kind(), "wasm");
}

#[test]
fn test_get_code_unknown_is_not_found() {
    let rt = TestRuntime::new();
    assert_eq!(
        rt.registry.get_code("ghost"),
        Err(SkillError::NotFound("ghost".to_string()))
    );
}

#[test]
fn test_reload_after_restart() {
    let rt = TestRuntime::new();
    register_add_and_double(&rt);
    assert_eq!(rt.composer.run("double", json!({"x": 4})).unwrap(), json!({"result": 8}));

    let (registry, composer) = rt.reopen();
    assert!(registry.is_empty());
    assert_eq!(registry.load_persisted().unwrap(), 2);

    assert_eq!(registry.get_code("add").unwrap(), ADD_WAT);
    assert_eq!(composer.run("double", json!({"x": 4})).unwrap(), json!({"result": 8}));
    let inputs: Vec<_> = registry
        .get("add")
        .unwrap()
        .metadata
        .inputs
        .names()
        .map(str::to_string)
        .collect();
    assert_eq!(inputs, vec!["a", "b"]);
}

#[test]
fn test_reload_skips_rows_that_fail_to_load() {
    let rt = TestRuntime::new();
    rt.register("leaf", LEAF_WAT, &[]);
    // Written behind the registry's back, as if from an older build
    rt.registry
        .store()
        .save(&SkillMetadata::new("broken", "bad"), "(module (func")
        .unwrap();

    let (registry, composer) = rt.reopen();
    assert_eq!(registry.load_persisted().unwrap(), 1);
    assert!(registry.contains("leaf"));
    assert!(!registry.contains("broken"));
    assert_eq!(composer.run("leaf", json!({})).unwrap(), json!({"ok": 1}));
}

#[test]
fn test_invalid_code_is_rejected_and_prior_kept() {
    let rt = TestRuntime::new();
    rt.register("add", ADD_WAT, &[("a", InputType::Integer), ("b", InputType::Integer)]);

    let err = rt
        .registry
        .register(SkillMetadata::new("add", "broken"), "(module (func".to_string())
        .unwrap_err();
    assert!(matches!(err, SkillError::Registration { .. }));

    assert_eq!(rt.registry.get_code("add").unwrap(), ADD_WAT);
    assert_eq!(
        rt.composer.run("add", json!({"a": 2, "b": 3})).unwrap(),
        json!({"result": 5})
    );
    // Persisted row untouched too
    let (registry, _) = rt.reopen();
    registry.load_persisted().unwrap();
    assert_eq!(registry.get_code("add").unwrap(), ADD_WAT);
}

#[test]
fn test_module_without_callable_is_rejected() {
    let rt = TestRuntime::new();
    let err = rt
        .registry
        .register(SkillMetadata::new("hidden", ""), NO_EXPORT_WAT.to_string())
        .unwrap_err();
    assert!(matches!(err, SkillError::Registration { .. }));
    assert!(!rt.registry.contains("hidden"));
}

#[test]
fn test_unknown_import_is_rejected() {
    let rt = TestRuntime::new();
    let err = rt
        .registry
        .register(SkillMetadata::new("attack", ""), BAD_IMPORT_WAT.to_string())
        .unwrap_err();
    assert!(err.to_string().contains("attack"));
    assert!(matches!(err, SkillError::Registration { .. }));
}

#[test]
fn test_typed_entry_must_match_inputs() {
    let rt = TestRuntime::new();
    let err = rt
        .registry
        .register(
            metadata("typed_add", &[("a", InputType::Integer)]),
            TYPED_ADD_WAT.to_string(),
        )
        .unwrap_err();
    assert!(matches!(err, SkillError::Registration { .. }));
}

#[test]
fn test_invalid_name_is_rejected() {
    let rt = TestRuntime::new();
    let err = rt
        .registry
        .register(SkillMetadata::new("../escape", ""), LEAF_WAT.to_string())
        .unwrap_err();
    assert!(matches!(err, SkillError::Registration { .. }));
}

#[test]
fn test_reregister_replaces_entry() {
    let rt = TestRuntime::new();
    rt.register("thing", LEAF_WAT, &[]);
    rt.register("thing", ADD_WAT, &[("a", InputType::Integer), ("b", InputType::Integer)]);

    assert_eq!(rt.registry.len(), 1);
    assert_eq!(rt.registry.get_code("thing").unwrap(), ADD_WAT);
    // Entry falls back to the first public export, `add`
    assert_eq!(
        rt.composer.run("thing", json!({"a": 1, "b": 1})).unwrap(),
        json!({"result": 2})
    );
}

#[test]
fn test_unregister_twice() {
    let rt = TestRuntime::new();
    rt.register("leaf", LEAF_WAT, &[]);

    assert_eq!(rt.registry.unregister("leaf"), Ok(()));
    assert_eq!(
        rt.registry.unregister("leaf"),
        Err(SkillError::NotFound("leaf".to_string()))
    );

    let (registry, _) = rt.reopen();
    assert_eq!(registry.load_persisted().unwrap(), 0);
}

#[test]
fn test_list_names_are_unique() {
    let rt = TestRuntime::new();
    register_add_and_double(&rt);
    rt.register("leaf", LEAF_WAT, &[]);
    rt.register("leaf", LEAF_WAT, &[]);

    let names: Vec<String> = rt.registry.list().into_iter().map(|m| m.name).collect();
    let unique: HashSet<&String> = names.iter().collect();
    assert_eq!(names.len(), 3);
    assert_eq!(unique.len(), 3);
    for name in &names {
        assert!(rt.registry.get(name).is_some());
    }
}

#[test]
fn test_catalog_events() {
    let rt = TestRuntime::new();
    let mut events = rt.registry.subscribe();

    rt.register("leaf", LEAF_WAT, &[]);
    rt.registry.unregister("leaf").unwrap();
    let _ = rt
        .registry
        .register(SkillMetadata::new("bad", ""), "nonsense".to_string());

    assert_eq!(
        events.try_recv().unwrap(),
        CatalogEvent::Registered("leaf".to_string())
    );
    assert_eq!(
        events.try_recv().unwrap(),
        CatalogEvent::Unregistered("leaf".to_string())
    );
    assert!(events.try_recv().is_err());
}
