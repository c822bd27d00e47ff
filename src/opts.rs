//! Hierarchical typed option tree.
//!
//! Options live at dotted paths under a root group and carry one of the
//! typed values {enum, bit, boolean, string, int, double}. Every option
//! advertises its type name, description, current value and permitted
//! values; values can be set from `name=value` command-line fragments.

use std::fmt;
use std::io::Write;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum OptError {
    #[error("no option or group at '{0}'")]
    NotFound(String),
    #[error("'{0}' is a group, not an option")]
    NotAnOption(String),
    #[error("cannot parse '{value}' as {ty}")]
    BadValue { value: String, ty: &'static str },
    #[error("argument '{0}' is not of the form name=value")]
    BadArgument(String),
}

/// Typed payload of an option leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum OptValue {
    Boolean(bool),
    Int(i64),
    Double(f64),
    Str(String),
    /// A named bit inside a flag word.
    Bit { value: u32, mask: u32 },
    Enum {
        choices: Vec<&'static str>,
        index: usize,
    },
}

impl OptValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            OptValue::Boolean(_) => "boolean",
            OptValue::Int(_) => "int",
            OptValue::Double(_) => "double",
            OptValue::Str(_) => "string",
            OptValue::Bit { .. } => "bit",
            OptValue::Enum { .. } => "enum",
        }
    }

    /// Permitted values, when enumerable.
    pub fn permitted(&self) -> Option<Vec<String>> {
        match self {
            OptValue::Boolean(_) | OptValue::Bit { .. } => {
                Some(vec!["true".into(), "false".into()])
            }
            OptValue::Enum { choices, .. } => {
                Some(choices.iter().map(|c| c.to_string()).collect())
            }
            _ => None,
        }
    }

    fn set_from_str(&mut self, s: &str) -> Result<(), OptError> {
        let bad = |ty| OptError::BadValue {
            value: s.to_string(),
            ty,
        };
        match self {
            OptValue::Boolean(v) => {
                *v = parse_bool(s).ok_or(bad("boolean"))?;
            }
            OptValue::Int(v) => {
                *v = s.parse().map_err(|_| bad("int"))?;
            }
            OptValue::Double(v) => {
                *v = s.parse().map_err(|_| bad("double"))?;
            }
            OptValue::Str(v) => {
                *v = s.to_string();
            }
            OptValue::Bit { value, mask } => {
                let on = parse_bool(s).ok_or(bad("bit"))?;
                if on {
                    *value |= *mask;
                } else {
                    *value &= !*mask;
                }
            }
            OptValue::Enum { choices, index } => {
                *index = choices
                    .iter()
                    .position(|c| *c == s)
                    .ok_or(bad("enum"))?;
            }
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for OptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptValue::Boolean(v) => write!(f, "{}", v),
            OptValue::Int(v) => write!(f, "{}", v),
            OptValue::Double(v) => write!(f, "{}", v),
            OptValue::Str(v) => write!(f, "{}", v),
            OptValue::Bit { value, mask } => write!(f, "{}", (value & mask) != 0),
            OptValue::Enum { choices, index } => {
                write!(f, "{}", choices.get(*index).copied().unwrap_or("?"))
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OptId(usize);

enum Entry {
    Group { children: Vec<OptId> },
    Leaf(OptValue),
}

struct OptEntry {
    name: String,
    desc: String,
    entry: Entry,
}

/// The option tree; entry 0 is the root group.
pub struct OptTree {
    entries: Vec<OptEntry>,
}

impl OptTree {
    pub fn new() -> OptTree {
        OptTree {
            entries: vec![OptEntry {
                name: String::new(),
                desc: "root".into(),
                entry: Entry::Group {
                    children: Vec::new(),
                },
            }],
        }
    }

    pub fn root(&self) -> OptId {
        OptId(0)
    }

    pub fn is_root(&self, id: OptId) -> bool {
        id.0 == 0
    }

    /// Find or create a group under `parent`.
    pub fn get_grp(&mut self, parent: OptId, name: &str) -> OptId {
        if let Some(existing) = self.find_child(parent, name) {
            return existing;
        }
        let id = OptId(self.entries.len());
        self.entries.push(OptEntry {
            name: name.to_string(),
            desc: String::new(),
            entry: Entry::Group {
                children: Vec::new(),
            },
        });
        match &mut self.entries[parent.0].entry {
            Entry::Group { children } => children.push(id),
            Entry::Leaf(_) => crate::init::fatal("options: leaf used as group"),
        }
        id
    }

    /// Add an option leaf to a group.
    pub fn add_opt(&mut self, grp: OptId, name: &str, desc: &str, value: OptValue) -> OptId {
        let id = OptId(self.entries.len());
        self.entries.push(OptEntry {
            name: name.to_string(),
            desc: desc.to_string(),
            entry: Entry::Leaf(value),
        });
        match &mut self.entries[grp.0].entry {
            Entry::Group { children } => children.push(id),
            Entry::Leaf(_) => crate::init::fatal("options: leaf used as group"),
        }
        id
    }

    fn find_child(&self, parent: OptId, name: &str) -> Option<OptId> {
        match &self.entries[parent.0].entry {
            Entry::Group { children } => children
                .iter()
                .copied()
                .find(|c| self.entries[c.0].name == name),
            Entry::Leaf(_) => None,
        }
    }

    /// Resolve a dotted path from the root.
    pub fn resolve(&self, path: &str) -> Option<OptId> {
        let mut cur = self.root();
        for part in path.split('.') {
            cur = self.find_child(cur, part)?;
        }
        Some(cur)
    }

    pub fn value(&self, id: OptId) -> Option<&OptValue> {
        match &self.entries[id.0].entry {
            Entry::Leaf(v) => Some(v),
            Entry::Group { .. } => None,
        }
    }

    pub fn type_name(&self, id: OptId) -> &'static str {
        match &self.entries[id.0].entry {
            Entry::Leaf(v) => v.type_name(),
            Entry::Group { .. } => "group",
        }
    }

    pub fn description(&self, id: OptId) -> &str {
        &self.entries[id.0].desc
    }

    pub fn value_to_string(&self, id: OptId) -> Option<String> {
        self.value(id).map(|v| v.to_string())
    }

    /// Set an option from a `path.to.option=value` argument.
    pub fn set_from_arg(&mut self, arg: &str) -> Result<(), OptError> {
        let (path, value) = arg
            .split_once('=')
            .ok_or_else(|| OptError::BadArgument(arg.to_string()))?;
        let id = self
            .resolve(path)
            .ok_or_else(|| OptError::NotFound(path.to_string()))?;
        match &mut self.entries[id.0].entry {
            Entry::Leaf(v) => v.set_from_str(value),
            Entry::Group { .. } => Err(OptError::NotAnOption(path.to_string())),
        }
    }

    /// Print `name  type  value  description` lines for every option
    /// below `id`.
    pub fn print_help(&self, id: OptId, out: &mut dyn Write) -> std::io::Result<()> {
        self.print_help_rec(id, &self.path_of(id), out)
    }

    fn path_of(&self, id: OptId) -> String {
        // entries are append-only; reconstruct the path by search
        fn walk(tree: &OptTree, cur: OptId, target: OptId, path: &mut Vec<String>) -> bool {
            if cur == target {
                return true;
            }
            if let Entry::Group { children } = &tree.entries[cur.0].entry {
                for &c in children {
                    path.push(tree.entries[c.0].name.clone());
                    if walk(tree, c, target, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }
        let mut path = Vec::new();
        walk(self, self.root(), id, &mut path);
        path.join(".")
    }

    fn print_help_rec(
        &self,
        id: OptId,
        prefix: &str,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        match &self.entries[id.0].entry {
            Entry::Leaf(v) => {
                writeln!(
                    out,
                    "{:<30} {:<8} {:<12} {}",
                    prefix,
                    v.type_name(),
                    v.to_string(),
                    self.entries[id.0].desc
                )
            }
            Entry::Group { children } => {
                for &c in children.clone().iter() {
                    let name = &self.entries[c.0].name;
                    let child_prefix = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", prefix, name)
                    };
                    self.print_help_rec(c, &child_prefix, out)?;
                }
                Ok(())
            }
        }
    }
}

impl Default for OptTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> OptTree {
        let mut t = OptTree::new();
        let root = t.root();
        let opt = t.get_grp(root, "opt");
        let unroll = t.get_grp(opt, "unroll");
        t.add_opt(unroll, "factor", "unroll factor", OptValue::Int(4));
        t.add_opt(
            unroll,
            "fixup",
            "fixup shape",
            OptValue::Enum {
                choices: vec!["auto", "loop", "switch"],
                index: 0,
            },
        );
        let be = t.get_grp(root, "be");
        t.add_opt(be, "verify", "run the verifier", OptValue::Boolean(true));
        t
    }

    #[test]
    fn dotted_lookup_and_set() {
        let mut t = sample_tree();
        let id = t.resolve("opt.unroll.factor").unwrap();
        assert_eq!(t.value_to_string(id).unwrap(), "4");
        t.set_from_arg("opt.unroll.factor=8").unwrap();
        assert_eq!(t.value_to_string(id).unwrap(), "8");
        assert_eq!(t.type_name(id), "int");
    }

    #[test]
    fn enum_rejects_unknown_choice() {
        let mut t = sample_tree();
        assert!(t.set_from_arg("opt.unroll.fixup=loop").is_ok());
        let err = t.set_from_arg("opt.unroll.fixup=banana").unwrap_err();
        assert!(matches!(err, OptError::BadValue { .. }));
        let id = t.resolve("opt.unroll.fixup").unwrap();
        assert_eq!(
            t.value(id).unwrap().permitted().unwrap(),
            vec!["auto", "loop", "switch"]
        );
    }

    #[test]
    fn groups_are_created_once() {
        let mut t = OptTree::new();
        let root = t.root();
        let a1 = t.get_grp(root, "be");
        let a2 = t.get_grp(root, "be");
        assert_eq!(a1, a2);
        assert!(t.is_root(root));
        assert!(!t.is_root(a1));
    }

    #[test]
    fn errors_name_the_problem() {
        let mut t = sample_tree();
        assert_eq!(
            t.set_from_arg("nosuch.thing=1"),
            Err(OptError::NotFound("nosuch.thing".into()))
        );
        assert_eq!(
            t.set_from_arg("opt.unroll=1"),
            Err(OptError::NotAnOption("opt.unroll".into()))
        );
        assert!(matches!(
            t.set_from_arg("be.verify"),
            Err(OptError::BadArgument(_))
        ));
    }

    #[test]
    fn help_lists_every_option() {
        let t = sample_tree();
        let mut buf = Vec::new();
        t.print_help(t.root(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("opt.unroll.factor"));
        assert!(text.contains("be.verify"));
        assert!(text.contains("boolean"));
    }
}
