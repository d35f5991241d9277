//! Symbols injected into the assembly namespace.
//!
//! A `Value` is anything a scope frame can bind a name to: a register, a
//! memory reservation, a branch-target label, a literal, or a deferred slot
//! that is filled in during `finalize_code`. Values are cheap to clone;
//! rebinding a name to an equal value is a no-op, so equality semantics
//! matter here. Deferred slots compare by identity, everything else is
//! structural.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::AsmError;

/// A declared register: `.reg .u32 name`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegSym {
    pub ty: String,
    pub name: String,
}

impl RegSym {
    pub fn new(ty: &str, name: &str) -> Self {
        Self {
            ty: ty.to_string(),
            name: name.to_string(),
        }
    }
}

/// Array suffix of a memory reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArraySpec {
    /// Plain scalar, no suffix.
    None,
    /// `name[]` — length fixed later by the linker or an initializer.
    Unbounded,
    /// `name[n]`.
    Fixed(u32),
}

/// A memory reservation in some state space: `.shared.u32 name[12]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MemSym {
    pub space: String,
    pub ty: String,
    pub name: String,
    pub array: ArraySpec,
    pub init: Option<String>,
}

impl MemSym {
    pub fn new(space: &str, ty: &str, name: &str, array: ArraySpec, init: Option<&str>) -> Self {
        Self {
            space: space.to_string(),
            ty: ty.to_string(),
            name: name.to_string(),
            array,
            init: init.map(str::to_string),
        }
    }
}

/// A branch target.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSym {
    pub name: String,
}

impl LabelSym {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[derive(Debug)]
struct DeferredInner {
    name: String,
    slot: RefCell<Option<String>>,
}

/// A deferred text slot, shared between the statement stream and the
/// fragment that will eventually fill it in.
///
/// The slot may be rewritten any number of times up to and including the
/// finalize phase; the renderer reads it exactly once, and a slot still
/// empty at that point is a fatal error.
#[derive(Debug, Clone)]
pub struct Deferred(Rc<DeferredInner>);

impl Deferred {
    pub fn new(name: &str) -> Self {
        Deferred(Rc::new(DeferredInner {
            name: name.to_string(),
            slot: RefCell::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Fill (or overwrite) the slot.
    pub fn set(&self, value: impl fmt::Display) {
        *self.0.slot.borrow_mut() = Some(value.to_string());
    }

    pub fn is_resolved(&self) -> bool {
        self.0.slot.borrow().is_some()
    }

    /// Read the slot, failing if it was never filled.
    pub fn resolve(&self) -> Result<String, AsmError> {
        self.0
            .slot
            .borrow()
            .clone()
            .ok_or_else(|| AsmError::UnresolvedDeferred(self.0.name.clone()))
    }
}

// Identity, not contents: two slots with the same name are still distinct
// bindings.
impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Anything a scope can bind a name to.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Reg(RegSym),
    Mem(MemSym),
    Label(LabelSym),
    Str(String),
    Num(i64),
    Deferred(Deferred),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(s.to_string())
    }

    /// The text this value contributes to a rendered statement.
    pub fn render(&self) -> Result<String, AsmError> {
        match self {
            Value::Reg(r) => Ok(r.name.clone()),
            Value::Mem(m) => Ok(m.name.clone()),
            Value::Label(l) => Ok(l.name.clone()),
            Value::Str(s) => Ok(s.clone()),
            Value::Num(n) => Ok(n.to_string()),
            Value::Deferred(d) => d.resolve(),
        }
    }

    /// Name to report when this value is at fault in an error.
    pub fn describe(&self) -> &str {
        match self {
            Value::Reg(r) => &r.name,
            Value::Mem(m) => &m.name,
            Value::Label(l) => &l.name,
            Value::Str(s) => s,
            Value::Num(_) => "<numeric>",
            Value::Deferred(d) => d.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_identity_equality() {
        let a = Deferred::new("slot");
        let b = Deferred::new("slot");
        let a2 = a.clone();
        assert_ne!(Value::Deferred(a.clone()), Value::Deferred(b));
        assert_eq!(Value::Deferred(a), Value::Deferred(a2));
    }

    #[test]
    fn test_deferred_resolution() {
        let d = Deferred::new("nsamples");
        assert!(!d.is_resolved());
        assert!(matches!(
            d.resolve(),
            Err(AsmError::UnresolvedDeferred(ref n)) if n == "nsamples"
        ));
        d.set(12);
        d.set(24);
        assert_eq!(d.resolve().unwrap(), "24");
    }

    #[test]
    fn test_value_render() {
        assert_eq!(
            Value::Reg(RegSym::new("u32", "tid")).render().unwrap(),
            "tid"
        );
        assert_eq!(Value::Num(-3).render().unwrap(), "-3");
        assert_eq!(Value::str("%ctaid.x").render().unwrap(), "%ctaid.x");
    }
}
