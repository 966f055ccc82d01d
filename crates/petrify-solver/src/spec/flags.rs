use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

/// Flag types recognized on a spec, in canonical order.
pub const FLAG_TYPES: [&str; 6] = [
    "cflags", "cxxflags", "fflags", "cppflags", "ldflags", "ldlibs",
];

pub fn is_flag_type(name: &str) -> bool {
    FLAG_TYPES.contains(&name)
}

/// One compiler flag, together with the group it was written in and the
/// provenance of the constraint that contributed it.
///
/// Equality and hashing consider the flag text only: two occurrences of
/// `-O2` are the same flag no matter which constraint introduced them. The
/// extra fields exist for ordering and grouping during reconstruction.
#[derive(Debug, Clone)]
pub struct CompilerFlag {
    pub flag: String,
    pub propagate: bool,
    /// The whitespace-joined group this flag was declared in, e.g. `-a -b`.
    pub flag_group: String,
    /// Provenance of the constraint that set this flag (a package id with a
    /// constraint-origin suffix, `compiler`, or `literal`).
    pub source: String,
}

impl CompilerFlag {
    pub fn new(flag: &str, propagate: bool, flag_group: &str, source: &str) -> CompilerFlag {
        CompilerFlag {
            flag: flag.to_string(),
            propagate,
            flag_group: flag_group.to_string(),
            source: source.to_string(),
        }
    }
}

impl PartialEq for CompilerFlag {
    fn eq(&self, other: &Self) -> bool {
        self.flag == other.flag
    }
}

impl Eq for CompilerFlag {}

impl Hash for CompilerFlag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.flag.hash(state);
    }
}

/// Split a flag group into individual flags.
pub fn tokenize_flags(flag_group: &str) -> Vec<String> {
    flag_group
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Compiler flags of a spec, grouped per flag type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagMap {
    flags: IndexMap<String, Vec<CompilerFlag>>,
}

impl FlagMap {
    pub fn new() -> FlagMap {
        FlagMap::default()
    }

    pub fn add_flag(
        &mut self,
        flag_type: &str,
        flag: &str,
        propagate: bool,
        flag_group: &str,
        source: &str,
    ) {
        self.flags
            .entry(flag_type.to_string())
            .or_default()
            .push(CompilerFlag::new(flag, propagate, flag_group, source));
    }

    pub fn get(&self, flag_type: &str) -> &[CompilerFlag] {
        self.flags.get(flag_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set(&mut self, flag_type: &str, flags: Vec<CompilerFlag>) {
        if flags.is_empty() {
            self.flags.shift_remove(flag_type);
        } else {
            self.flags.insert(flag_type.to_string(), flags);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<CompilerFlag>)> {
        self.flags.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.values().all(Vec::is_empty)
    }

    /// Flag types that currently have flags, in insertion order.
    pub fn flag_types(&self) -> Vec<String> {
        self.flags
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Extend a flag list preserving order and precedence: flags already present
/// are moved to the end so they take higher precedence on the compile line.
pub fn extend_flag_list(flag_list: &mut Vec<CompilerFlag>, new_flags: &[CompilerFlag]) {
    for flag in new_flags {
        flag_list.retain(|existing| existing != flag);
        flag_list.push(flag.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_equality_ignores_provenance() {
        let a = CompilerFlag::new("-O2", false, "-O2", "compiler");
        let b = CompilerFlag::new("-O2", false, "-O2 -g", "literal");
        assert_eq!(a, b);
    }

    #[test]
    fn test_extend_flag_list_moves_duplicates_to_end() {
        let mut list = vec![
            CompilerFlag::new("-a", false, "-a -b", "x"),
            CompilerFlag::new("-b", false, "-a -b", "x"),
        ];
        extend_flag_list(
            &mut list,
            &[CompilerFlag::new("-a", false, "-a", "y")],
        );
        let flags: Vec<&str> = list.iter().map(|f| f.flag.as_str()).collect();
        assert_eq!(flags, vec!["-b", "-a"]);
    }

    #[test]
    fn test_tokenize_flags() {
        assert_eq!(tokenize_flags("-a  -b"), vec!["-a", "-b"]);
    }
}
