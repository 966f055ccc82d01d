//! Ground facts and the problem-instance builder.
//!
//! The builder is an append-only emitter of typed facts and comments. The
//! rendered text is what gets hashed for the concretization cache; the
//! typed facts are what the bundled backend grounds. Emission order is
//! deterministic unless randomization is explicitly requested (a
//! benchmarking knob, never enabled by default).

use std::fmt;

use petrify_version::Version;

/// Identifies one node slot in the solver encoding before a concrete spec
/// exists for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeArgument {
    pub id: u32,
    pub pkg: String,
}

impl NodeArgument {
    /// The canonical (minimal duplicate id) node for a package.
    pub fn make(pkg: &str) -> NodeArgument {
        NodeArgument {
            id: 0,
            pkg: pkg.to_string(),
        }
    }
}

impl fmt::Display for NodeArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({},\"{}\")", self.id, self.pkg)
    }
}

/// One argument of a ground fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Atom {
    Str(String),
    Int(i64),
    Node(NodeArgument),
    Nested(Box<Fact>),
}

impl Atom {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Atom::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodeArgument> {
        match self {
            Atom::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_fact(&self) -> Option<&Fact> {
        match self {
            Atom::Nested(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Str(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Atom::Int(i) => write!(f, "{}", i),
            Atom::Node(n) => write!(f, "{}", n),
            Atom::Nested(fact) => write!(f, "{}", fact),
        }
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Atom {
        Atom::Str(s.to_string())
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Atom {
        Atom::Str(s)
    }
}

impl From<&String> for Atom {
    fn from(s: &String) -> Atom {
        Atom::Str(s.clone())
    }
}

impl From<i64> for Atom {
    fn from(i: i64) -> Atom {
        Atom::Int(i)
    }
}

impl From<u64> for Atom {
    fn from(i: u64) -> Atom {
        Atom::Int(i as i64)
    }
}

impl From<usize> for Atom {
    fn from(i: usize) -> Atom {
        Atom::Int(i as i64)
    }
}

impl From<&Version> for Atom {
    fn from(v: &Version) -> Atom {
        Atom::Str(v.to_string())
    }
}

impl From<NodeArgument> for Atom {
    fn from(n: NodeArgument) -> Atom {
        Atom::Node(n)
    }
}

impl From<Fact> for Atom {
    fn from(f: Fact) -> Atom {
        Atom::Nested(Box::new(f))
    }
}

/// Convert a list of heterogeneous values into fact arguments.
macro_rules! atoms {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::solver::fact::Atom::from($arg)),*]
    };
}
pub(crate) use atoms;

/// A typed ground fact, e.g. `version_declared("1.0", 0, "package_def")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fact {
    pub name: String,
    pub args: Vec<Atom>,
}

impl Fact {
    pub fn new(name: &str, args: Vec<Atom>) -> Fact {
        Fact {
            name: name.to_string(),
            args,
        }
    }

    /// An `attr(...)` fact: the first argument names the attribute.
    pub fn attr(attr_name: &str, mut rest: Vec<Atom>) -> Fact {
        let mut args = vec![Atom::Str(attr_name.to_string())];
        args.append(&mut rest);
        Fact::new("attr", args)
    }

    /// A `pkg_fact(pkg, inner)` fact scoping `inner` to a package.
    pub fn pkg_fact(pkg: &str, inner: Fact) -> Fact {
        Fact::new("pkg_fact", atoms![pkg, inner])
    }

    /// Attribute name of an `attr(...)` fact, if this is one.
    pub fn attr_name(&self) -> Option<&str> {
        if self.name != "attr" {
            return None;
        }
        self.args.first().and_then(Atom::as_str)
    }

    /// Arguments after the attribute name of an `attr(...)` fact.
    pub fn attr_args(&self) -> &[Atom] {
        if self.name == "attr" && !self.args.is_empty() {
            &self.args[1..]
        } else {
            &[]
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone)]
enum Line {
    Fact(Fact),
    Comment(String),
    Blank,
}

/// Append-only builder for one problem instance.
pub struct ProgramBuilder {
    /// Shuffle seed for benchmarking runs; `None` keeps emission order.
    randomize: Option<u64>,
    lines: Vec<Line>,
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder {
            randomize: None,
            lines: Vec::new(),
        }
    }

    /// Randomize fact order with the given seed. Benchmarking only; the
    /// semantics of the program must not depend on order.
    pub fn randomized(seed: u64) -> ProgramBuilder {
        ProgramBuilder {
            randomize: Some(seed),
            lines: Vec::new(),
        }
    }

    pub fn fact(&mut self, fact: Fact) {
        self.lines.push(Line::Fact(fact));
    }

    fn title(&mut self, header: &str, ch: char) {
        let sep: String = std::iter::repeat(ch).take(76).collect();
        self.lines.push(Line::Blank);
        self.lines.push(Line::Comment(sep.clone()));
        self.lines.push(Line::Comment(header.to_string()));
        self.lines.push(Line::Comment(sep));
    }

    pub fn h1(&mut self, header: &str) {
        self.title(header, '=');
    }

    pub fn h2(&mut self, header: &str) {
        self.title(header, '-');
    }

    pub fn h3(&mut self, header: &str) {
        self.lines.push(Line::Comment(header.to_string()));
    }

    pub fn newline(&mut self) {
        self.lines.push(Line::Blank);
    }

    /// All facts, in emission order (or shuffled when randomizing).
    pub fn facts(&self) -> Vec<Fact> {
        let mut facts: Vec<Fact> = self
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Fact(f) => Some(f.clone()),
                _ => None,
            })
            .collect();
        if let Some(seed) = self.randomize {
            shuffle(&mut facts, seed);
        }
        facts
    }

    /// Rendered program text.
    pub fn text(&self) -> String {
        let mut rendered = String::new();
        if self.randomize.is_some() {
            for fact in self.facts() {
                rendered.push_str(&format!("{}.\n", fact));
            }
            return rendered;
        }
        for line in &self.lines {
            match line {
                Line::Fact(f) => rendered.push_str(&format!("{}.\n", f)),
                Line::Comment(c) => rendered.push_str(&format!("% {}\n", c)),
                Line::Blank => rendered.push('\n'),
            }
        }
        rendered
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        ProgramBuilder::new()
    }
}

/// Fisher-Yates with a small xorshift generator, so randomized runs do not
/// pull in an RNG dependency.
fn shuffle(facts: &mut [Fact], seed: u64) {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for i in (1..facts.len()).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        facts.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_display() {
        let fact = Fact::pkg_fact("zlib", Fact::new("version_declared", atoms!["1.3", 0usize]));
        assert_eq!(fact.to_string(), "pkg_fact(\"zlib\",version_declared(\"1.3\",0))");
    }

    #[test]
    fn test_attr_accessors() {
        let fact = Fact::attr("node", atoms![NodeArgument::make("zlib")]);
        assert_eq!(fact.attr_name(), Some("node"));
        assert_eq!(fact.attr_args().len(), 1);
    }

    #[test]
    fn test_builder_text_and_facts() {
        let mut builder = ProgramBuilder::new();
        builder.h1("Header");
        builder.fact(Fact::new("virtual", atoms!["mpi"]));
        builder.newline();

        let text = builder.text();
        assert!(text.contains("% Header"));
        assert!(text.contains("virtual(\"mpi\")."));
        assert_eq!(builder.facts().len(), 1);
    }

    #[test]
    fn test_randomized_emission_is_a_permutation() {
        let mut builder = ProgramBuilder::randomized(42);
        for i in 0..20usize {
            builder.fact(Fact::new("f", atoms![i]));
        }
        let mut ints: Vec<i64> = builder
            .facts()
            .iter()
            .map(|f| f.args[0].as_int().unwrap())
            .collect();
        ints.sort();
        assert_eq!(ints, (0..20).collect::<Vec<i64>>());
    }
}
