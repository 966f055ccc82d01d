//! Text form of specs.
//!
//! Grammar (whitespace separated tokens):
//! `name[@constraint] [+variant] [~variant] [variant=value] [cflags="..."]
//! [platform=...] [os=...] [target=...] [namespace=...] [^dep ...] [%tool ...]`
//!
//! `^` starts a transitive dependency constraint of the root, `%` a direct
//! (build-tool) dependency; either applies following attribute tokens to
//! that dependency until the next `^`/`%`.

use std::sync::Arc;

use petrify_version::VersionConstraint;

use crate::deptype;
use crate::error::{ConcretizeError, Result};
use crate::spec::{is_flag_type, tokenize_flags, Spec, Variant, VariantValue};

impl Spec {
    /// Parse a spec from its text form.
    pub fn parse(text: &str) -> Result<Spec> {
        let tokens = lex(text)?;
        if tokens.is_empty() {
            return Ok(Spec::anonymous());
        }

        let mut root = Spec::anonymous();
        // Dependencies under construction: (spec, direct)
        let mut deps: Vec<(Spec, bool)> = Vec::new();
        let mut saw_head = false;

        for token in tokens {
            if let Some(rest) = token.strip_prefix('^') {
                let mut dep = Spec::anonymous();
                apply_head(&mut dep, rest, text)?;
                deps.push((dep, false));
                continue;
            }
            if let Some(rest) = token.strip_prefix('%') {
                let mut dep = Spec::anonymous();
                apply_head(&mut dep, rest, text)?;
                deps.push((dep, true));
                continue;
            }

            let deps_empty = deps.is_empty();
            let current = match deps.last_mut() {
                Some((dep, _)) => dep,
                None => &mut root,
            };

            if !saw_head && deps_empty && is_head_token(&token) {
                apply_head(current, &token, text)?;
                saw_head = true;
                continue;
            }
            apply_attribute(current, &token, text)?;
        }

        for (dep, direct) in deps {
            if dep.is_anonymous() {
                return Err(parse_error(text, "dependency constraint without a name"));
            }
            let depflag = if direct {
                deptype::BUILD
            } else {
                deptype::DEFAULT
            };
            root.add_dependency_edge(Arc::new(dep), depflag, Vec::new(), direct);
        }

        Ok(root)
    }
}

fn parse_error(spec: &str, message: impl Into<String>) -> ConcretizeError {
    ConcretizeError::SpecParse {
        spec: spec.to_string(),
        message: message.into(),
    }
}

/// Split into whitespace-separated tokens, keeping double-quoted sections
/// (with their spaces) inside a single token. Quotes are dropped.
fn lex(text: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in text.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(parse_error(text, "unterminated quote"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn is_head_token(token: &str) -> bool {
    if token.starts_with('@') {
        return true;
    }
    // `name` or `name@constraint`; attribute tokens have '=' before any '@'
    match token.split_once('@') {
        Some((name, _)) => valid_name(name),
        None => !token.contains('=') && valid_name(token),
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Apply a head token `name[@constraint]` or bare `@constraint`.
fn apply_head(spec: &mut Spec, token: &str, whole: &str) -> Result<()> {
    let (name, version) = match token.split_once('@') {
        Some((name, version)) => (name, Some(version)),
        None => (token, None),
    };
    if !name.is_empty() {
        if !valid_name(name) {
            return Err(parse_error(whole, format!("invalid package name '{name}'")));
        }
        spec.name = name.to_string();
    }
    if let Some(version) = version {
        spec.versions = version
            .parse::<VersionConstraint>()
            .map_err(|e| parse_error(whole, e.to_string()))?;
    }
    Ok(())
}

fn apply_attribute(spec: &mut Spec, token: &str, whole: &str) -> Result<()> {
    if let Some(version) = token.strip_prefix('@') {
        spec.versions = version
            .parse::<VersionConstraint>()
            .map_err(|e| parse_error(whole, e.to_string()))?;
        return Ok(());
    }

    if let Some(name) = token.strip_prefix('+') {
        return set_bool_variant(spec, name, true, whole);
    }
    if let Some(name) = token.strip_prefix('~') {
        return set_bool_variant(spec, name, false, whole);
    }

    if let Some((key, value)) = token.split_once('=') {
        let (value, propagate) = match value.strip_prefix('=') {
            Some(rest) => (rest, true),
            None => (value, false),
        };

        if is_flag_type(key) {
            for flag in tokenize_flags(value) {
                spec.compiler_flags.add_flag(key, &flag, propagate, value, "");
            }
            return Ok(());
        }

        match key {
            "platform" => spec.arch.platform = Some(value.to_string()),
            "os" => spec.arch.os = Some(value.to_string()),
            "target" => spec.arch.target = Some(value.to_string()),
            "namespace" => spec.namespace = Some(value.to_string()),
            _ => {
                if !valid_name(key) {
                    return Err(parse_error(whole, format!("invalid variant name '{key}'")));
                }
                let variant_value = if value.contains(',') {
                    VariantValue::Multi(value.split(',').map(str::to_string).collect())
                } else {
                    match value {
                        "true" | "True" => VariantValue::Bool(true),
                        "false" | "False" => VariantValue::Bool(false),
                        other => VariantValue::Single(other.to_string()),
                    }
                };
                let mut variant = Variant::new(variant_value);
                variant.propagate = propagate;
                spec.variants.insert(key.to_string(), variant);
            }
        }
        return Ok(());
    }

    // A leading dash negates a variant, same as '~'.
    if let Some(name) = token.strip_prefix('-') {
        if valid_name(name) {
            return set_bool_variant(spec, name, false, whole);
        }
    }

    Err(parse_error(whole, format!("unexpected token '{token}'")))
}

fn set_bool_variant(spec: &mut Spec, name: &str, value: bool, whole: &str) -> Result<()> {
    if !valid_name(name) {
        return Err(parse_error(whole, format!("invalid variant name '{name}'")));
    }
    spec.variants
        .insert(name.to_string(), Variant::new(VariantValue::Bool(value)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_and_version() {
        let spec = Spec::parse("zlib@1.2:1.3").unwrap();
        assert_eq!(spec.name, "zlib");
        assert_eq!(spec.versions.to_string(), "1.2:1.3");
    }

    #[test]
    fn test_parse_variants() {
        let spec = Spec::parse("pkg +shared ~static opt=high libs=a,b").unwrap();
        assert_eq!(
            spec.variants.get("shared").unwrap().value,
            VariantValue::Bool(true)
        );
        assert_eq!(
            spec.variants.get("static").unwrap().value,
            VariantValue::Bool(false)
        );
        assert_eq!(
            spec.variants.get("opt").unwrap().value,
            VariantValue::Single("high".into())
        );
        assert_eq!(
            spec.variants.get("libs").unwrap().value,
            VariantValue::Multi(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_parse_flags_keep_group() {
        let spec = Spec::parse("pkg cflags=\"-O2 -g\"").unwrap();
        let flags = spec.compiler_flags.get("cflags");
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].flag, "-O2");
        assert_eq!(flags[0].flag_group, "-O2 -g");
    }

    #[test]
    fn test_parse_dependencies() {
        let spec = Spec::parse("x ^y@=2.0 +fast ^z %gcc@12").unwrap();
        assert_eq!(spec.edges.len(), 3);
        assert_eq!(spec.edges[0].spec.name, "y");
        assert!(spec.edges[0].spec.versions.is_exact());
        assert_eq!(
            spec.edges[0].spec.variants.get("fast").unwrap().value,
            VariantValue::Bool(true)
        );
        assert_eq!(spec.edges[1].spec.name, "z");
        assert!(spec.edges[2].direct);
        assert_eq!(spec.edges[2].spec.name, "gcc");
    }

    #[test]
    fn test_parse_arch_and_namespace() {
        let spec = Spec::parse("pkg platform=linux os=ubuntu24 target=x86_64 namespace=builtin")
            .unwrap();
        assert_eq!(spec.arch.platform.as_deref(), Some("linux"));
        assert_eq!(spec.arch.os.as_deref(), Some("ubuntu24"));
        assert_eq!(spec.arch.target.as_deref(), Some("x86_64"));
        assert_eq!(spec.namespace.as_deref(), Some("builtin"));
    }

    #[test]
    fn test_parse_anonymous_constraint() {
        let spec = Spec::parse("+shared @2.0:").unwrap();
        assert!(spec.is_anonymous());
        assert!(spec.variants.contains_key("shared"));
        assert!(!spec.versions.is_any());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Spec::parse("pkg ^").is_err());
        assert!(Spec::parse("pkg cflags=\"-O2").is_err());
        assert!(Spec::parse("pkg +bad!name").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let text = "x@1.2 +shared ^y@=2.0";
        let spec = Spec::parse(text).unwrap();
        let reparsed = Spec::parse(&spec.to_string()).unwrap();
        assert_eq!(spec.to_string(), reparsed.to_string());
    }
}
