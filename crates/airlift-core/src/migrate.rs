//! Descriptor migrations
//!
//! Bundles built by older tooling are rewritten to the current descriptor
//! shape at load time, before `Bundle::parse` sees them. Migrations operate
//! on the raw YAML value so deprecated fields never need to exist on the
//! typed model.
//!
//! Covered rewrites:
//! - `scripts: {before, after, retry, ...}` → `actions: {before, after}`
//! - `setVariable: NAME` on an action → `setVariables: [{name: NAME}]`

use serde_yaml::{Mapping, Value};

use crate::error::{CoreError, Result};

/// Build versions older than this have no migration coverage.
const OLDEST_MIGRATABLE: u64 = 2;

/// Apply all migrations to a raw descriptor.
pub fn migrate(mut doc: Value) -> Result<Value> {
    check_version_skew(&doc)?;

    if let Some(components) = doc
        .get_mut("components")
        .and_then(Value::as_sequence_mut)
    {
        for component in components {
            if let Some(map) = component.as_mapping_mut() {
                migrate_scripts(map);
                migrate_set_variable(map);
            }
        }
    }
    Ok(doc)
}

fn check_version_skew(doc: &Value) -> Result<()> {
    let Some(built_with) = doc
        .get("build")
        .and_then(|b| b.get("version"))
        .and_then(Value::as_str)
    else {
        return Ok(());
    };
    // Only the major version gates migration coverage; dev builds ("UnknownVersion")
    // are accepted as-is.
    if let Ok(version) = semver::Version::parse(built_with.trim_start_matches('v')) {
        if version.major != 0 && version.major < OLDEST_MIGRATABLE {
            return Err(CoreError::VersionSkew {
                built_with: built_with.to_string(),
            });
        }
    }
    Ok(())
}

/// `scripts` predates `actions`; `before`/`after` lists of plain command
/// strings become action objects, and the script-level `retry` flag maps to
/// one retry per command.
fn migrate_scripts(component: &mut Mapping) {
    let Some(scripts) = component.remove("scripts") else {
        return;
    };
    let retries = scripts
        .get("retry")
        .and_then(Value::as_bool)
        .map(|retry| if retry { 1u64 } else { 0 })
        .unwrap_or(0);

    let mut actions = Mapping::new();
    for position in ["before", "after"] {
        let Some(cmds) = scripts.get(position).and_then(Value::as_sequence) else {
            continue;
        };
        let migrated: Vec<Value> = cmds
            .iter()
            .filter_map(Value::as_str)
            .map(|cmd| {
                let mut action = Mapping::new();
                action.insert("cmd".into(), cmd.into());
                if retries > 0 {
                    action.insert("maxRetries".into(), retries.into());
                }
                Value::Mapping(action)
            })
            .collect();
        actions.insert(position.into(), Value::Sequence(migrated));
    }

    // A component may carry both an old scripts block and a new actions
    // block across hand-edits; the actions block wins field by field.
    match component.get_mut("actions") {
        Some(Value::Mapping(existing)) => {
            for (key, value) in actions {
                existing.entry(key).or_insert(value);
            }
        }
        _ => {
            component.insert("actions".into(), Value::Mapping(actions));
        }
    }
}

/// `setVariable: NAME` became the `setVariables` list.
fn migrate_set_variable(component: &mut Mapping) {
    let Some(Value::Mapping(actions)) = component.get_mut("actions") else {
        return;
    };
    for position in ["before", "after", "onSuccess", "onFailure"] {
        let Some(list) = actions
            .get_mut(position)
            .and_then(Value::as_sequence_mut)
        else {
            continue;
        };
        for action in list {
            let Some(map) = action.as_mapping_mut() else {
                continue;
            };
            let Some(Value::String(name)) = map.remove("setVariable") else {
                continue;
            };
            let mut entry = Mapping::new();
            entry.insert("name".into(), Value::String(name));
            map.entry("setVariables".into())
                .or_insert_with(|| Value::Sequence(vec![]));
            if let Some(Value::Sequence(vars)) = map.get_mut("setVariables") {
                vars.push(Value::Mapping(entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;

    fn migrate_str(yaml: &str) -> Bundle {
        let doc: Value = serde_yaml::from_str(yaml).unwrap();
        let migrated = migrate(doc).unwrap();
        let text = serde_yaml::to_string(&migrated).unwrap();
        Bundle::parse(&text).unwrap()
    }

    #[test]
    fn scripts_become_actions() {
        let bundle = migrate_str(
            r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: a
    scripts:
      retry: true
      before:
        - ./prep.sh
      after:
        - ./verify.sh
"#,
        );
        let actions = &bundle.components[0].actions;
        assert_eq!(actions.before[0].cmd, "./prep.sh");
        assert_eq!(actions.before[0].max_retries, 1);
        assert_eq!(actions.after[0].cmd, "./verify.sh");
    }

    #[test]
    fn set_variable_scalar_becomes_list() {
        let bundle = migrate_str(
            r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: a
    actions:
      before:
        - cmd: echo 1.2.3
          setVariable: VERSION
"#,
        );
        let action = &bundle.components[0].actions.before[0];
        assert_eq!(action.set_variables.len(), 1);
        assert_eq!(action.set_variables[0].name, "VERSION");
    }

    #[test]
    fn version_skew_is_fatal() {
        let doc: Value = serde_yaml::from_str(
            r#"
kind: AppConfig
metadata:
  name: demo
build:
  version: v1.4.0
"#,
        )
        .unwrap();
        let err = migrate(doc).unwrap_err();
        assert!(matches!(err, CoreError::VersionSkew { built_with } if built_with == "v1.4.0"));
    }

    #[test]
    fn current_descriptor_untouched() {
        let bundle = migrate_str(
            r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: a
    actions:
      before:
        - cmd: true
"#,
        );
        assert_eq!(bundle.components[0].actions.before.len(), 1);
    }
}
