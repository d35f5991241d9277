//! Statement model for emitted assembly.
//!
//! A statement's text fields are trees of atoms, not strings: primitives,
//! symbol references and deferred slots, possibly nested in sequences.
//! Nothing is coerced to text until the formatter walks the finished
//! statement list, which is what lets a fragment hand out a `Deferred`
//! early and fill it in during `finalize_code`.

use crate::error::AsmError;
use crate::symbol::{Deferred, Value};

/// One node of a statement text field.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Lit(String),
    Val(Value),
    Seq(Vec<Atom>),
}

impl Atom {
    pub fn lit(s: impl Into<String>) -> Self {
        Atom::Lit(s.into())
    }

    pub fn empty() -> Self {
        Atom::Lit(String::new())
    }

    /// Flatten the tree to text. Sequences concatenate without separators;
    /// an unresolved deferred slot anywhere in the tree is fatal.
    pub fn flatten(&self) -> Result<String, AsmError> {
        match self {
            Atom::Lit(s) => Ok(s.clone()),
            Atom::Val(v) => v.render(),
            Atom::Seq(items) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(&item.flatten()?);
                }
                Ok(out)
            }
        }
    }
}

impl From<Value> for Atom {
    fn from(v: Value) -> Self {
        Atom::Val(v)
    }
}

impl From<&Value> for Atom {
    fn from(v: &Value) -> Self {
        Atom::Val(v.clone())
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom::Lit(s.to_string())
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Self {
        Atom::Lit(s)
    }
}

impl From<i64> for Atom {
    fn from(n: i64) -> Self {
        Atom::Val(Value::Num(n))
    }
}

impl From<Deferred> for Atom {
    fn from(d: Deferred) -> Self {
        Atom::Val(Value::Deferred(d))
    }
}

/// One line of assembly, in pre-rendered form.
///
/// `prefix` is left-padded to the running indent width rather than
/// indented, which is what labels and guard predicates want. A positive
/// `indent` delta takes effect after the line, a negative one before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub prefix: Atom,
    pub op: Atom,
    pub operands: Vec<Atom>,
    pub semi: bool,
    pub indent: i32,
}

impl Statement {
    pub fn new(prefix: Atom, op: Atom, operands: Vec<Atom>, semi: bool, indent: i32) -> Self {
        Self {
            prefix,
            op,
            operands,
            semi,
            indent,
        }
    }

    /// A plain `op` line with no prefix, operands or indent change.
    pub fn op(op: Atom, semi: bool) -> Self {
        Self::new(Atom::empty(), op, Vec::new(), semi, 0)
    }

    /// A directive carried entirely in the prefix field, e.g. `.version`.
    pub fn directive(text: &str) -> Self {
        Self::new(Atom::lit(text), Atom::empty(), Vec::new(), false, 0)
    }
}

/// Intersperse `sep` between the items without coercing anything to text.
pub fn intersperse(items: &[Atom], sep: &str) -> Vec<Atom> {
    let mut out = Vec::with_capacity(items.len() * 2);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(Atom::lit(sep));
        }
        out.push(item.clone());
    }
    out
}

/// Address operand for a memory operation: `[base]` or `[base+off]`.
pub fn addr(base: impl Into<Atom>, offset: Option<Atom>) -> Atom {
    let mut items = vec![Atom::lit("["), base.into()];
    if let Some(off) = offset {
        items.push(Atom::lit("+"));
        items.push(off);
    }
    items.push(Atom::lit("]"));
    Atom::Seq(items)
}

/// Vector operand: `{a, b}`.
pub fn vec_operand(parts: &[Atom]) -> Atom {
    let mut items = vec![Atom::lit("{")];
    items.extend(intersperse(parts, ", "));
    items.push(Atom::lit("}"));
    Atom::Seq(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::RegSym;

    fn reg(name: &str) -> Atom {
        Atom::Val(Value::Reg(RegSym::new("u32", name)))
    }

    #[test]
    fn test_flatten_nested_sequences() {
        let atom = Atom::Seq(vec![
            Atom::lit("a"),
            Atom::Seq(vec![Atom::lit("b"), Atom::Seq(vec![Atom::lit("c")])]),
            Atom::from(7i64),
        ]);
        assert_eq!(atom.flatten().unwrap(), "abc7");
    }

    #[test]
    fn test_flatten_rejects_unresolved_deferred() {
        let d = Deferred::new("len");
        let atom = Atom::Seq(vec![Atom::lit("["), Atom::from(d.clone()), Atom::lit("]")]);
        assert!(matches!(
            atom.flatten(),
            Err(AsmError::UnresolvedDeferred(ref n)) if n == "len"
        ));
        d.set(256);
        assert_eq!(atom.flatten().unwrap(), "[256]");
    }

    #[test]
    fn test_addr_and_vec_helpers() {
        let a = addr(reg("ptr"), None);
        assert_eq!(a.flatten().unwrap(), "[ptr]");
        let a = addr(reg("ptr"), Some(Atom::from(8i64)));
        assert_eq!(a.flatten().unwrap(), "[ptr+8]");
        let v = vec_operand(&[reg("lo"), reg("hi")]);
        assert_eq!(v.flatten().unwrap(), "{lo, hi}");
    }

    #[test]
    fn test_intersperse_keeps_atoms() {
        let out = intersperse(&[reg("a"), reg("b"), reg("c")], ", ");
        assert_eq!(out.len(), 5);
        assert_eq!(Atom::Seq(out).flatten().unwrap(), "a, b, c");
    }
}
