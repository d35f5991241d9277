//! Fragments and entries: the pluggable units the assembler composes.
//!
//! A fragment is a singleton per module build, identified by its kind. It
//! declares dependencies on other fragment kinds, contributes bindings to
//! the shared namespace, and participates in the fixed lifecycle
//! (`module_setup` → per-entry `entry_setup`/`entry_teardown` →
//! `finalize_code`). An entry is a fragment that additionally exposes a
//! device-callable function with parameters and a body.
//!
//! Kinds are plain strings; handles pair a kind with a constructor so the
//! resolver can instantiate a dependency it has not seen yet.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::EmitContext;
use crate::error::AsmError;
use crate::symbol::Value;

/// Identity of a fragment within one module build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentKind(pub String);

impl FragmentKind {
    pub fn new(name: &str) -> Self {
        FragmentKind(name.to_string())
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reusable unit of code generation.
///
/// Every lifecycle method defaults to a no-op; fragments override the ones
/// they need. All of them run inside an invocation wrapper, so symbols
/// declared in an open block by one fragment are visible to the next.
pub trait Fragment {
    fn kind(&self) -> FragmentKind;

    /// Fragment kinds this one depends on. Cycles are rejected before any
    /// code generation begins.
    fn deps(&self) -> Vec<FragmentHandle> {
        Vec::new()
    }

    /// Bindings to contribute to the module-wide namespace. Keys must be
    /// unique across all contributing sources.
    fn namespace(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Module-scope declarations. Runs once per pass, in global dependency
    /// order, before any entry is emitted.
    fn module_setup(&mut self, _cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        Ok(())
    }

    /// Code inserted at the start of each entry that depends on this
    /// fragment, in that entry's dependency order.
    fn entry_setup(&mut self, _cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        Ok(())
    }

    /// Code inserted at the end of each entry, in reverse dependency order.
    fn entry_teardown(&mut self, _cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        Ok(())
    }

    /// Last chance to fill deferred slots. Statement emission is rejected
    /// here.
    fn finalize_code(&mut self, _cx: &mut EmitContext<'_>) -> Result<(), AsmError> {
        Ok(())
    }

    /// Self-test entries exercising this fragment; built into the module
    /// when the caller asks for tests.
    fn tests(&self) -> Vec<EntryHandle> {
        Vec::new()
    }
}

/// An externally callable module function.
pub trait Entry: Fragment {
    /// Human-readable name, also used to report test results.
    fn name(&self) -> &str;

    /// Device code entry name.
    fn entry_name(&self) -> &str;

    /// Ordered `(type, name)` parameter list. Parameters become symbols
    /// visible only inside this entry's own scope.
    fn params(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Generate the entry body.
    fn body(&mut self, cx: &mut EmitContext<'_>) -> Result<(), AsmError>;
}

/// Constructor handle for a fragment kind.
#[derive(Clone)]
pub struct FragmentHandle {
    pub kind: FragmentKind,
    pub build: fn() -> Box<dyn Fragment>,
}

impl FragmentHandle {
    pub fn new(kind: &str, build: fn() -> Box<dyn Fragment>) -> Self {
        Self {
            kind: FragmentKind::new(kind),
            build,
        }
    }
}

impl fmt::Debug for FragmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentHandle")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Constructor handle for an entry kind.
#[derive(Clone)]
pub struct EntryHandle {
    pub kind: FragmentKind,
    pub build: fn() -> Box<dyn Entry>,
}

impl EntryHandle {
    pub fn new(kind: &str, build: fn() -> Box<dyn Entry>) -> Self {
        Self {
            kind: FragmentKind::new(kind),
            build,
        }
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("kind", &self.kind)
            .finish()
    }
}
