//! `${namespace.path}` interpolation against layered variable sources.
//!
//! Precedence, highest first: job variables, config variables, `ENV.*`,
//! `pagination.*` auto-counters, `input.*` from the previous step,
//! `metadata.*`. Job and config variables share the `variables` namespace;
//! the job layer wins.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::VariableError;

lazy_static! {
    static ref TOKEN_RE: Regex =
        Regex::new(r"(\\)?\$\{([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z0-9_\-]+)+)\}")
            .expect("token regex is valid");
}

/// Missing-key handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Missing keys and coercion failures are fatal.
    #[default]
    Strict,
    /// Missing keys leave the placeholder intact and record a warning.
    Lenient,
}

/// Target type when substituting into a typed config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceTarget {
    Number,
    Boolean,
    Array,
    Object,
}

impl CoerceTarget {
    fn name(&self) -> &'static str {
        match self {
            CoerceTarget::Number => "number",
            CoerceTarget::Boolean => "boolean",
            CoerceTarget::Array => "array",
            CoerceTarget::Object => "object",
        }
    }
}

/// Layered variable sources for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    job_vars: Value,
    config_vars: Value,
    env: HashMap<String, String>,
    pagination: HashMap<String, Value>,
    input: Value,
    metadata: Value,
}

impl VariableContext {
    pub fn new(job_vars: Value, config_vars: Value, metadata: Value) -> Self {
        Self {
            job_vars,
            config_vars,
            env: HashMap::new(),
            pagination: HashMap::new(),
            input: Value::Null,
            metadata,
        }
    }

    /// Capture the process environment into the `ENV` namespace.
    pub fn with_process_env(mut self) -> Self {
        self.env = std::env::vars().collect();
        self
    }

    /// Explicit `ENV` entries (tests, sandboxed runs).
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Update the `pagination.*` auto-counters for the current page.
    pub fn set_pagination(&mut self, page: u64, offset: u64) {
        self.pagination.insert("page".to_string(), Value::from(page));
        self.pagination
            .insert("offset".to_string(), Value::from(offset));
    }

    /// Output of the previous step, exposed as `input.*`.
    pub fn set_input(&mut self, input: Value) {
        self.input = input;
    }

    fn lookup(&self, namespace: &str, path: &[&str]) -> Result<Option<Value>, VariableError> {
        match namespace {
            "variables" => Ok(dig(&self.job_vars, path).or_else(|| dig(&self.config_vars, path))),
            "ENV" => Ok(path
                .first()
                .and_then(|name| self.env.get(*name))
                .map(|v| Value::String(v.clone()))),
            "pagination" => Ok(path
                .first()
                .and_then(|name| self.pagination.get(*name))
                .cloned()),
            "input" => Ok(dig(&self.input, path)),
            "metadata" => Ok(dig(&self.metadata, path)),
            other => Err(VariableError::UnknownNamespace(other.to_string())),
        }
    }
}

fn dig(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitution engine. Deterministic for identical inputs; recursive
/// expansion terminates within the depth cap.
#[derive(Debug, Clone)]
pub struct VariableResolver {
    mode: ResolveMode,
    max_depth: usize,
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self {
            mode: ResolveMode::Strict,
            max_depth: 4,
        }
    }
}

impl VariableResolver {
    pub fn new(mode: ResolveMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Resolve every token in `template`. Returns the expanded string plus
    /// lenient-mode warnings.
    pub fn resolve(
        &self,
        ctx: &VariableContext,
        template: &str,
    ) -> Result<(String, Vec<String>), VariableError> {
        let mut warnings = Vec::new();
        let mut stack = Vec::new();
        let out = self.expand(ctx, template, &mut stack, &mut warnings)?;
        Ok((out, warnings))
    }

    /// Resolve a template that must coerce into a typed field.
    pub fn resolve_typed(
        &self,
        ctx: &VariableContext,
        template: &str,
        target: CoerceTarget,
    ) -> Result<(Value, Vec<String>), VariableError> {
        let (resolved, warnings) = self.resolve(ctx, template)?;
        let parsed: Result<Value, _> = serde_json::from_str(&resolved);
        let coerced = match (target, parsed) {
            (CoerceTarget::Number, Ok(v @ Value::Number(_))) => Some(v),
            (CoerceTarget::Boolean, Ok(v @ Value::Bool(_))) => Some(v),
            (CoerceTarget::Array, Ok(v @ Value::Array(_))) => Some(v),
            (CoerceTarget::Object, Ok(v @ Value::Object(_))) => Some(v),
            _ => None,
        };
        match coerced {
            Some(v) => Ok((v, warnings)),
            None if self.mode == ResolveMode::Lenient => {
                let mut warnings = warnings;
                warnings.push(format!(
                    "could not coerce '{resolved}' into {}",
                    target.name()
                ));
                Ok((Value::String(resolved), warnings))
            }
            None => Err(VariableError::Coercion {
                token: template.to_string(),
                target: target.name(),
                value: resolved,
            }),
        }
    }

    fn expand(
        &self,
        ctx: &VariableContext,
        template: &str,
        stack: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<String, VariableError> {
        // regex::Regex::replace_all cannot propagate errors, so collect
        // failures on the side and splice manually.
        let mut error: Option<VariableError> = None;

        let out = TOKEN_RE.replace_all(template, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }
            match self.expand_token(ctx, caps, stack, warnings) {
                Ok(replacement) => replacement,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(out.into_owned()),
        }
    }

    fn expand_token(
        &self,
        ctx: &VariableContext,
        caps: &Captures,
        stack: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<String, VariableError> {
        let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();

        // Backslash escape yields the literal token.
        if caps.get(1).is_some() {
            return Ok(full.trim_start_matches('\\').to_string());
        }

        let namespace = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let raw_path = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let path: Vec<&str> = raw_path.split('.').filter(|s| !s.is_empty()).collect();
        let token = format!("{namespace}{raw_path}");

        if stack.iter().any(|t| t == &token) {
            return Err(VariableError::CircularReference(token));
        }
        if stack.len() >= self.max_depth {
            return Err(VariableError::DepthExceeded(self.max_depth));
        }

        match ctx.lookup(namespace, &path)? {
            Some(value) => {
                let rendered = stringify(&value);
                stack.push(token);
                let expanded = self.expand(ctx, &rendered, stack, warnings);
                stack.pop();
                expanded
            }
            None => match self.mode {
                ResolveMode::Strict => Err(VariableError::NotFound(token)),
                ResolveMode::Lenient => {
                    warnings.push(format!("unresolved variable ${{{token}}}"));
                    Ok(full.to_string())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> VariableContext {
        VariableContext::new(
            json!({"query": "alpha", "nested": {"city": "oslo"}}),
            json!({"query": "from-config", "limit": "25"}),
            json!({"source": "scheduler"}),
        )
    }

    #[test]
    fn job_variables_win_over_config_variables() {
        let resolver = VariableResolver::default();
        let (out, _) = resolver
            .resolve(&ctx(), "q=${variables.query}&limit=${variables.limit}")
            .unwrap();
        assert_eq!(out, "q=alpha&limit=25");
    }

    #[test]
    fn nested_paths_resolve() {
        let resolver = VariableResolver::default();
        let (out, _) = resolver
            .resolve(&ctx(), "city=${variables.nested.city}")
            .unwrap();
        assert_eq!(out, "city=oslo");
    }

    #[test]
    fn env_namespace_resolves_from_captured_env() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        let ctx = ctx().with_env(env);
        let resolver = VariableResolver::default();
        let (out, _) = resolver.resolve(&ctx, "key=${ENV.API_KEY}").unwrap();
        assert_eq!(out, "key=secret");
    }

    #[test]
    fn pagination_counters_resolve() {
        let mut ctx = ctx();
        ctx.set_pagination(3, 50);
        let resolver = VariableResolver::default();
        let (out, _) = resolver
            .resolve(&ctx, "?page=${pagination.page}&offset=${pagination.offset}")
            .unwrap();
        assert_eq!(out, "?page=3&offset=50");
    }

    #[test]
    fn metadata_namespace_resolves() {
        let resolver = VariableResolver::default();
        let (out, _) = resolver.resolve(&ctx(), "src=${metadata.source}").unwrap();
        assert_eq!(out, "src=scheduler");
    }

    #[test]
    fn escaped_tokens_stay_literal() {
        let resolver = VariableResolver::default();
        let (out, _) = resolver.resolve(&ctx(), r"\${variables.query}").unwrap();
        assert_eq!(out, "${variables.query}");
    }

    #[test]
    fn missing_key_is_fatal_in_strict_mode() {
        let resolver = VariableResolver::default();
        let err = resolver.resolve(&ctx(), "${variables.nope}").unwrap_err();
        assert_eq!(err, VariableError::NotFound("variables.nope".to_string()));
    }

    #[test]
    fn missing_key_warns_in_lenient_mode() {
        let resolver = VariableResolver::new(ResolveMode::Lenient);
        let (out, warnings) = resolver.resolve(&ctx(), "x=${variables.nope}").unwrap();
        assert_eq!(out, "x=${variables.nope}");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_namespace_is_rejected() {
        let resolver = VariableResolver::default();
        let err = resolver.resolve(&ctx(), "${secrets.key}").unwrap_err();
        assert_eq!(err, VariableError::UnknownNamespace("secrets".to_string()));
    }

    #[test]
    fn recursive_substitution_resolves_through_layers() {
        let ctx = VariableContext::new(
            json!({"outer": "${variables.inner}!", "inner": "deep"}),
            json!({}),
            json!({}),
        );
        let resolver = VariableResolver::default();
        let (out, _) = resolver.resolve(&ctx, "${variables.outer}").unwrap();
        assert_eq!(out, "deep!");
    }

    #[test]
    fn circular_references_are_detected() {
        let ctx = VariableContext::new(
            json!({"a": "${variables.b}", "b": "${variables.a}"}),
            json!({}),
            json!({}),
        );
        let resolver = VariableResolver::default();
        let err = resolver.resolve(&ctx, "${variables.a}").unwrap_err();
        assert!(matches!(err, VariableError::CircularReference(_)));
    }

    #[test]
    fn self_reference_is_detected() {
        let ctx = VariableContext::new(json!({"a": "${variables.a}"}), json!({}), json!({}));
        let resolver = VariableResolver::default();
        let err = resolver.resolve(&ctx, "${variables.a}").unwrap_err();
        assert_eq!(
            err,
            VariableError::CircularReference("variables.a".to_string())
        );
    }

    #[test]
    fn depth_cap_bounds_chained_expansion() {
        let ctx = VariableContext::new(
            json!({
                "v1": "${variables.v2}",
                "v2": "${variables.v3}",
                "v3": "${variables.v4}",
                "v4": "${variables.v5}",
                "v5": "${variables.v6}",
                "v6": "end",
            }),
            json!({}),
            json!({}),
        );
        let resolver = VariableResolver::default();
        let err = resolver.resolve(&ctx, "${variables.v1}").unwrap_err();
        assert_eq!(err, VariableError::DepthExceeded(4));
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = VariableResolver::default();
        let a = resolver.resolve(&ctx(), "q=${variables.query}").unwrap();
        let b = resolver.resolve(&ctx(), "q=${variables.query}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn typed_coercion_parses_numbers_and_booleans() {
        let ctx = VariableContext::new(
            json!({"limit": "25", "flag": "true"}),
            json!({}),
            json!({}),
        );
        let resolver = VariableResolver::default();
        let (v, _) = resolver
            .resolve_typed(&ctx, "${variables.limit}", CoerceTarget::Number)
            .unwrap();
        assert_eq!(v, json!(25));
        let (v, _) = resolver
            .resolve_typed(&ctx, "${variables.flag}", CoerceTarget::Boolean)
            .unwrap();
        assert_eq!(v, json!(true));
    }

    #[test]
    fn failed_coercion_is_fatal_in_strict_mode() {
        let ctx = VariableContext::new(json!({"limit": "lots"}), json!({}), json!({}));
        let resolver = VariableResolver::default();
        let err = resolver
            .resolve_typed(&ctx, "${variables.limit}", CoerceTarget::Number)
            .unwrap_err();
        assert!(matches!(err, VariableError::Coercion { .. }));
    }

    #[test]
    fn failed_coercion_warns_in_lenient_mode() {
        let ctx = VariableContext::new(json!({"limit": "lots"}), json!({}), json!({}));
        let resolver = VariableResolver::new(ResolveMode::Lenient);
        let (v, warnings) = resolver
            .resolve_typed(&ctx, "${variables.limit}", CoerceTarget::Number)
            .unwrap();
        assert_eq!(v, json!("lots"));
        assert_eq!(warnings.len(), 1);
    }
}
