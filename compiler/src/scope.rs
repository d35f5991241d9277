//! Lexical scope tracking for symbols that outlive their declaring call.
//!
//! The generated assembly has its own block structure, unrelated to the
//! Rust call stack that produces it: a helper called from a fragment may
//! declare a register that the caller, and every later fragment invoked in
//! the same block, must still see. This module implements:
//!
//! - frames: one per open assembly block, each holding a symbol table
//!   seeded from its parent, the statements emitted inside it, and the
//!   injectors currently active in it;
//! - injectors: per-invocation bookkeeping of exactly which bindings an
//!   invocation's ambient view gained, so that closing a block can retract
//!   precisely the names declared inside it and nothing else.
//!
//! Frames close in strict LIFO order. A frame inherits the single most
//! recently created active injector from its parent at push time, and pop
//! verifies that exactly that injector is still present; any other state is
//! an internal consistency violation and fails the build.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::AsmError;
use crate::stmt::Statement;
use crate::symbol::Value;

/// Bookkeeping for one fragment-function invocation's ambient namespace.
#[derive(Debug)]
pub struct Injector {
    id: u64,
    view: BTreeMap<String, Value>,
    added: BTreeSet<String>,
}

impl Injector {
    fn new(id: u64, snapshot: &BTreeMap<String, Value>) -> Self {
        // Every snapshot binding counts as added by this injector: it is
        // what seeded the invocation's view.
        let added = snapshot.keys().cloned().collect();
        Self {
            id,
            view: snapshot.clone(),
            added,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Propagate a binding into this invocation's view.
    fn inject(&mut self, name: &str, value: &Value) -> Result<(), AsmError> {
        match self.view.get(name) {
            Some(existing) if existing == value => Ok(()),
            Some(_) => Err(AsmError::SymbolCollision(name.to_string())),
            None => {
                self.view.insert(name.to_string(), value.clone());
                self.added.insert(name.to_string());
                Ok(())
            }
        }
    }

    /// Remove the given names, but only those this injector itself added.
    fn retract(&mut self, names: &BTreeSet<String>) {
        for name in names {
            if self.added.remove(name) {
                self.view.remove(name);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sees(&self, name: &str) -> bool {
        self.view.contains_key(name)
    }
}

#[derive(Debug)]
struct Frame {
    symbols: BTreeMap<String, Value>,
    code: Vec<Statement>,
    injectors: Vec<Injector>,
    /// Id of the injector moved in from the parent at push time, if any.
    carried: Option<u64>,
}

impl Frame {
    fn outer() -> Self {
        Self {
            symbols: BTreeMap::new(),
            code: Vec::new(),
            injectors: Vec::new(),
            carried: None,
        }
    }
}

/// The scope stack for one in-progress module build.
#[derive(Debug)]
pub struct BlockStack {
    frames: Vec<Frame>,
    next_injector: u64,
}

impl Default for BlockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStack {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::outer()],
            next_injector: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("stack always has an outer frame")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("stack always has an outer frame")
    }

    /// Open a new frame. The symbol table is seeded from the current top
    /// frame; the most recently created active injector, if any, moves into
    /// the new frame so that the enclosing invocation keeps seeing bindings
    /// made inside the block for as long as it stays open.
    pub fn push(&mut self) {
        let top = self.top_mut();
        let carried = top.injectors.pop();
        let symbols = top.symbols.clone();
        self.frames.push(Frame {
            symbols,
            code: Vec::new(),
            injectors: carried.into_iter().collect(),
            carried: None,
        });
        let frame = self.top_mut();
        frame.carried = frame.injectors.first().map(Injector::id);
    }

    /// Close the top frame: merge its statements into the parent, retract
    /// from the carried injector exactly the names this frame added, and
    /// hand the injector back to the parent.
    pub fn pop(&mut self) -> Result<(), AsmError> {
        if self.frames.len() == 1 {
            return Err(AsmError::StackUnderflow);
        }
        let closing = self.frames.pop().expect("depth checked above");

        // Exactly the injector carried in at push time may remain; an
        // invocation begun inside the frame must have ended inside it.
        let consistent = match closing.carried {
            Some(id) => closing.injectors.len() == 1 && closing.injectors[0].id() == id,
            None => closing.injectors.is_empty(),
        };
        if !consistent {
            self.frames.truncate(1);
            return Err(AsmError::InjectorMismatch);
        }

        let parent = self.top_mut();
        let added: BTreeSet<String> = closing
            .symbols
            .keys()
            .filter(|k| !parent.symbols.contains_key(*k))
            .cloned()
            .collect();
        for mut inj in closing.injectors {
            inj.retract(&added);
            parent.injectors.push(inj);
        }
        parent.code.extend(closing.code);
        Ok(())
    }

    /// Bind `name` in the top frame and propagate it into every active
    /// injector. Rebinding to an equal value is a no-op.
    pub fn inject(&mut self, name: &str, value: Value) -> Result<(), AsmError> {
        let top = self.top_mut();
        match top.symbols.get(name) {
            Some(existing) if *existing == value => return Ok(()),
            Some(_) => return Err(AsmError::SymbolCollision(name.to_string())),
            None => {
                top.symbols.insert(name.to_string(), value.clone());
            }
        }
        for inj in &mut top.injectors {
            inj.inject(name, &value)?;
        }
        Ok(())
    }

    /// Look a name up in the current scope.
    pub fn lookup(&self, name: &str) -> Result<&Value, AsmError> {
        self.top()
            .symbols
            .get(name)
            .ok_or_else(|| AsmError::UnresolvedSymbol(name.to_string()))
    }

    /// Append a statement to the current frame.
    pub fn emit(&mut self, stmt: Statement) {
        self.top_mut().code.push(stmt);
    }

    /// Start a fragment-function invocation: create an injector seeded with
    /// the current frame's bindings and register it as active.
    pub fn begin_invocation(&mut self) -> u64 {
        let id = self.next_injector;
        self.next_injector += 1;
        let inj = Injector::new(id, &self.top().symbols);
        self.top_mut().injectors.push(inj);
        id
    }

    /// End an invocation. Its injector must be back in the top frame, which
    /// holds whenever blocks opened during the invocation were closed.
    pub fn end_invocation(&mut self, id: u64) -> Result<(), AsmError> {
        let top = self.top_mut();
        match top.injectors.iter().position(|i| i.id() == id) {
            Some(pos) => {
                top.injectors.remove(pos);
                Ok(())
            }
            None => Err(AsmError::InjectorMismatch),
        }
    }

    /// Failure-path variant of [`end_invocation`](Self::end_invocation):
    /// drop the injector wherever unwinding left it.
    pub fn force_end_invocation(&mut self, id: u64) {
        for frame in self.frames.iter_mut().rev() {
            if let Some(pos) = frame.injectors.iter().position(|i| i.id() == id) {
                frame.injectors.remove(pos);
                return;
            }
        }
    }

    /// Failure-path unwind: discard every frame above `depth`, bindings,
    /// statements and injectors included.
    pub fn truncate(&mut self, depth: usize) {
        let depth = depth.max(1);
        while self.frames.len() > depth {
            self.frames.pop();
        }
    }

    /// Consume the stack and return the accumulated statement list.
    /// Meaningful only at depth one.
    pub fn into_code(mut self) -> Vec<Statement> {
        debug_assert_eq!(self.frames.len(), 1, "stack not unwound before render");
        self.frames
            .pop()
            .map(|f| f.code)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn active_injectors(&self) -> usize {
        self.frames.iter().map(|f| f.injectors.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::{Atom, Statement};
    use crate::symbol::RegSym;

    fn reg(name: &str) -> Value {
        Value::Reg(RegSym::new("u32", name))
    }

    #[test]
    fn test_push_seeds_symbols_from_parent() {
        let mut stack = BlockStack::new();
        stack.inject("outer", reg("outer")).unwrap();
        stack.push();
        assert_eq!(stack.lookup("outer").unwrap(), &reg("outer"));
        stack.inject("inner", reg("inner")).unwrap();
        stack.pop().unwrap();
        assert!(matches!(
            stack.lookup("inner"),
            Err(AsmError::UnresolvedSymbol(ref n)) if n == "inner"
        ));
        assert!(stack.lookup("outer").is_ok());
    }

    #[test]
    fn test_reinject_equal_value_is_noop() {
        let mut stack = BlockStack::new();
        stack.inject("x", reg("x")).unwrap();
        stack.inject("x", reg("x")).unwrap();
        assert!(matches!(
            stack.inject("x", Value::Num(3)),
            Err(AsmError::SymbolCollision(ref n)) if n == "x"
        ));
    }

    #[test]
    fn test_pop_merges_statements_into_parent() {
        let mut stack = BlockStack::new();
        stack.emit(Statement::op(Atom::lit("a"), true));
        stack.push();
        stack.emit(Statement::op(Atom::lit("b"), true));
        stack.pop().unwrap();
        stack.emit(Statement::op(Atom::lit("c"), true));
        let code = stack.into_code();
        let ops: Vec<String> = code.iter().map(|s| s.op.flatten().unwrap()).collect();
        assert_eq!(ops, ["a", "b", "c"]);
    }

    #[test]
    fn test_injector_follows_block_and_retracts() {
        let mut stack = BlockStack::new();
        let id = stack.begin_invocation();
        stack.push();
        stack.inject("r", reg("r")).unwrap();
        // The carried injector sees the new binding while the block is open.
        assert!(stack.frames.last().unwrap().injectors[0].sees("r"));
        stack.pop().unwrap();
        // Closed block: the binding is gone from both frame and injector.
        assert!(stack.lookup("r").is_err());
        assert!(!stack.frames.last().unwrap().injectors[0].sees("r"));
        stack.end_invocation(id).unwrap();
        assert_eq!(stack.active_injectors(), 0);
    }

    #[test]
    fn test_back_to_back_invocations_share_frame_bindings() {
        let mut stack = BlockStack::new();
        stack.push();
        let first = stack.begin_invocation();
        stack.inject("a", reg("a")).unwrap();
        stack.end_invocation(first).unwrap();
        // Second invocation in the same frame sees what the first declared.
        let second = stack.begin_invocation();
        assert!(stack.lookup("a").is_ok());
        stack.end_invocation(second).unwrap();
        stack.pop().unwrap();
        assert!(stack.lookup("a").is_err());
    }

    #[test]
    fn test_nested_invocation_injector_is_not_carried_twice() {
        let mut stack = BlockStack::new();
        let outer = stack.begin_invocation();
        stack.push();
        let inner = stack.begin_invocation();
        stack.inject("x", reg("x")).unwrap();
        stack.end_invocation(inner).unwrap();
        // Binding survives the inner invocation within the open frame.
        assert!(stack.lookup("x").is_ok());
        stack.pop().unwrap();
        stack.end_invocation(outer).unwrap();
        assert!(stack.lookup("x").is_err());
    }

    #[test]
    fn test_pop_with_leaked_invocation_is_mismatch() {
        let mut stack = BlockStack::new();
        let _outer = stack.begin_invocation();
        stack.push();
        // An invocation begun inside the frame but never ended.
        let _leak = stack.begin_invocation();
        assert!(matches!(stack.pop(), Err(AsmError::InjectorMismatch)));
        // The failed pop unwinds to the outer frame.
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_pop_outer_frame_underflows() {
        let mut stack = BlockStack::new();
        assert!(matches!(stack.pop(), Err(AsmError::StackUnderflow)));
    }

    #[test]
    fn test_truncate_discards_partial_frames() {
        let mut stack = BlockStack::new();
        stack.inject("keep", reg("keep")).unwrap();
        stack.push();
        stack.push();
        stack.inject("gone", reg("gone")).unwrap();
        stack.truncate(1);
        assert_eq!(stack.depth(), 1);
        assert!(stack.lookup("keep").is_ok());
        assert!(stack.lookup("gone").is_err());
    }
}
