//! Template variable resolution
//!
//! Manifests, chart values and placed files may carry `###AIRLIFT_CONST_X###`
//! and `###AIRLIFT_VAR_X###` placeholders. Constants come from the bundle
//! descriptor and never change; variables are seeded from declarations,
//! `--set` overrides and prompt answers, and may be overwritten mid-deploy by
//! actions that capture stdout. Expansion is plain text substitution, no
//! expression language.

use indexmap::IndexMap;
use std::collections::HashMap;

use crate::bundle::Bundle;
use crate::error::{CoreError, Result};

const CONST_PREFIX: &str = "###AIRLIFT_CONST_";
const VAR_PREFIX: &str = "###AIRLIFT_VAR_";
const SUFFIX: &str = "###";

/// A resolved variable value with its sensitivity flag
#[derive(Debug, Clone)]
pub struct VariableValue {
    pub value: String,
    pub sensitive: bool,
}

/// The live variable state of one deploy
///
/// Built once from the bundle and user input, then shared with the component
/// executor which feeds action outputs back in. The deploy session wraps this
/// in a mutex since `set_variable` writers race with readers in later steps.
#[derive(Debug, Clone, Default)]
pub struct VariableState {
    constants: IndexMap<String, String>,
    variables: IndexMap<String, VariableValue>,
}

impl VariableState {
    /// Seed from a bundle's constants and variable declarations plus the
    /// user's `--set` overrides. Prompt answers are supplied by the caller
    /// through the same map; a declared prompt variable with no value and no
    /// default is an input error.
    pub fn new(bundle: &Bundle, overrides: &HashMap<String, String>) -> Result<Self> {
        for name in overrides.keys() {
            if !bundle.variables.iter().any(|v| &v.name == name) {
                return Err(CoreError::UnknownVariable { name: name.clone() });
            }
        }

        let mut constants = IndexMap::new();
        for constant in &bundle.constants {
            constants.insert(constant.name.clone(), constant.value.clone());
        }

        let mut variables = IndexMap::new();
        for decl in &bundle.variables {
            let value = overrides
                .get(&decl.name)
                .cloned()
                .or_else(|| decl.default.clone());
            if let Some(value) = value {
                variables.insert(
                    decl.name.clone(),
                    VariableValue {
                        value,
                        sensitive: decl.sensitive,
                    },
                );
            }
        }

        Ok(Self {
            constants,
            variables,
        })
    }

    /// Write a variable from an action's captured output. Undeclared names
    /// are allowed here: actions may introduce coordination variables that
    /// the descriptor never lists.
    pub fn set(&mut self, name: &str, value: String, sensitive: bool) {
        self.variables
            .insert(name.to_string(), VariableValue { value, sensitive });
    }

    /// Look up a variable value.
    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.variables.get(name)
    }

    /// Expand every placeholder in `content`.
    ///
    /// Unknown placeholders are fatal: a half-substituted manifest applied
    /// to a cluster is worse than a failed deploy. `origin` names the file
    /// being expanded for the error message.
    pub fn expand(&self, content: &str, origin: &str) -> Result<String> {
        let mut out = content.to_string();

        for (name, value) in &self.constants {
            let needle = format!("{CONST_PREFIX}{name}{SUFFIX}");
            out = out.replace(&needle, value);
        }
        for (name, value) in &self.variables {
            let needle = format!("{VAR_PREFIX}{name}{SUFFIX}");
            out = out.replace(&needle, &value.value);
        }

        if let Some(placeholder) = find_placeholder(&out) {
            return Err(CoreError::UnresolvedPlaceholder {
                placeholder,
                path: origin.to_string(),
            });
        }
        Ok(out)
    }

    /// Expand a file in place.
    pub fn expand_file(&self, path: &std::path::Path) -> Result<()> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            // Binary payloads are placed untouched.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !content.contains("###AIRLIFT_") {
            return Ok(());
        }
        let expanded = self.expand(&content, &path.display().to_string())?;
        std::fs::write(path, expanded)?;
        Ok(())
    }

    /// Variables exported into action environments, `AIRLIFT_VAR_<NAME>`.
    pub fn action_env(&self) -> Vec<(String, String)> {
        self.variables
            .iter()
            .map(|(name, v)| (format!("AIRLIFT_VAR_{name}"), v.value.clone()))
            .collect()
    }
}

fn find_placeholder(content: &str) -> Option<String> {
    for prefix in [CONST_PREFIX, VAR_PREFIX] {
        if let Some(start) = content.find(prefix) {
            let rest = &content[start..];
            let end = match rest[prefix.len()..].find(SUFFIX) {
                Some(i) => prefix.len() + i + SUFFIX.len(),
                // Unterminated placeholder: report up to the end of the line.
                None => rest.find(['\n', ' ']).unwrap_or(rest.len()),
            };
            return Some(rest[..end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;

    fn bundle() -> Bundle {
        Bundle::parse(
            r#"
kind: AppConfig
metadata:
  name: demo
constants:
  - name: DOMAIN
    value: example.internal
variables:
  - name: VERSION
    default: 0.0.0
  - name: TOKEN
    sensitive: true
"#,
        )
        .unwrap()
    }

    #[test]
    fn constants_and_defaults_expand() {
        let state = VariableState::new(&bundle(), &HashMap::new()).unwrap();
        let out = state
            .expand(
                "host: app.###AIRLIFT_CONST_DOMAIN###\ntag: ###AIRLIFT_VAR_VERSION###\n",
                "test",
            )
            .unwrap();
        assert_eq!(out, "host: app.example.internal\ntag: 0.0.0\n");
    }

    #[test]
    fn overrides_beat_defaults() {
        let overrides = HashMap::from([("VERSION".to_string(), "9.9.9".to_string())]);
        let state = VariableState::new(&bundle(), &overrides).unwrap();
        let out = state.expand("###AIRLIFT_VAR_VERSION###", "test").unwrap();
        assert_eq!(out, "9.9.9");
    }

    #[test]
    fn undeclared_override_rejected() {
        let overrides = HashMap::from([("NOPE".to_string(), "x".to_string())]);
        let err = VariableState::new(&bundle(), &overrides).unwrap_err();
        assert!(matches!(err, CoreError::UnknownVariable { name } if name == "NOPE"));
    }

    #[test]
    fn action_set_variable_visible_to_later_expansion() {
        let mut state = VariableState::new(&bundle(), &HashMap::new()).unwrap();
        state.set("VERSION", "1.2.3".to_string(), false);
        let out = state.expand("###AIRLIFT_VAR_VERSION###", "test").unwrap();
        assert_eq!(out, "1.2.3");
    }

    #[test]
    fn unresolved_placeholder_is_fatal() {
        let state = VariableState::new(&bundle(), &HashMap::new()).unwrap();
        let err = state
            .expand("value: ###AIRLIFT_VAR_MISSING###", "deploy.yaml")
            .unwrap_err();
        match err {
            CoreError::UnresolvedPlaceholder { placeholder, path } => {
                assert_eq!(placeholder, "###AIRLIFT_VAR_MISSING###");
                assert_eq!(path, "deploy.yaml");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sensitive_flag_carried() {
        let overrides = HashMap::from([("TOKEN".to_string(), "hunter2".to_string())]);
        let state = VariableState::new(&bundle(), &overrides).unwrap();
        assert!(state.get("TOKEN").unwrap().sensitive);
    }
}
