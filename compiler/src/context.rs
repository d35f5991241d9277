//! The context handed to every fragment callable.
//!
//! Fragments never touch the scope stack directly; they receive an
//! `EmitContext` giving them symbol lookup, symbol constructors (`reg`,
//! `mem`, `label`), the operation builder, nested blocks, invocation
//! wrapping for helper calls, and the staleness flag that drives
//! recompilation. The context also enforces the finalize-phase rule that
//! no further statements may be emitted.

use crate::error::AsmError;
use crate::scope::BlockStack;
use crate::stmt::{intersperse, Atom, Statement};
use crate::symbol::{ArraySpec, LabelSym, MemSym, RegSym, Value};

/// Optional predication of a single operation.
///
/// At most one polarity may be set; requesting both is a configuration
/// error reported at emission time.
#[derive(Debug, Clone, Default)]
pub struct Guard {
    pub ifp: Option<Value>,
    pub ifnotp: Option<Value>,
}

impl Guard {
    pub fn none() -> Self {
        Self::default()
    }

    /// Execute only when `pred` is set.
    pub fn ifp(pred: Value) -> Self {
        Self {
            ifp: Some(pred),
            ifnotp: None,
        }
    }

    /// Execute only when `pred` is clear.
    pub fn ifnotp(pred: Value) -> Self {
        Self {
            ifp: None,
            ifnotp: Some(pred),
        }
    }

    fn prefix(&self, mnemonic: &str) -> Result<Atom, AsmError> {
        match (&self.ifp, &self.ifnotp) {
            (Some(_), Some(_)) => Err(AsmError::ConflictingGuard(mnemonic.to_string())),
            (Some(p), None) => Ok(Atom::Seq(vec![Atom::lit("@"), Atom::from(p)])),
            (None, Some(p)) => Ok(Atom::Seq(vec![Atom::lit("@!"), Atom::from(p)])),
            (None, None) => Ok(Atom::empty()),
        }
    }
}

/// Builds a dotted operation mnemonic token by token, then emits it with an
/// operand list. State resets after each emission, so one builder can be
/// reused for a whole run of operations.
#[derive(Debug, Default)]
pub struct Op {
    tokens: Vec<String>,
}

impl Op {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a pre-dotted mnemonic, e.g. `"mad.lo.u32"`.
    pub fn parse(mnemonic: &str) -> Self {
        let mut op = Self::new();
        for tok in mnemonic.split('.').filter(|t| !t.is_empty()) {
            op.push(tok);
        }
        op
    }

    pub fn push(&mut self, token: &str) -> &mut Self {
        self.tokens.push(token.to_string());
        self
    }

    /// Emit `mnemonic operands;` into the current frame and reset.
    pub fn emit(
        &mut self,
        cx: &mut EmitContext<'_>,
        operands: &[Atom],
        guard: Guard,
    ) -> Result<(), AsmError> {
        if self.tokens.is_empty() {
            return Err(AsmError::EmptyOp);
        }
        let mnemonic = self.tokens.join(".");
        self.tokens.clear();
        let prefix = guard.prefix(&mnemonic)?;
        let ops = if operands.is_empty() {
            Vec::new()
        } else {
            vec![Atom::Seq(intersperse(operands, ", "))]
        };
        cx.code(Statement::new(prefix, Atom::lit(mnemonic), ops, true, 0))
    }
}

/// Per-invocation handle onto the in-progress build.
pub struct EmitContext<'a> {
    stack: &'a mut BlockStack,
    stale: &'a mut bool,
    emit_allowed: bool,
}

impl<'a> EmitContext<'a> {
    pub(crate) fn new(stack: &'a mut BlockStack, stale: &'a mut bool) -> Self {
        Self {
            stack,
            stale,
            emit_allowed: true,
        }
    }

    /// Switch into the finalize phase: deferred slots may be written, but
    /// statement emission is rejected from here on.
    pub(crate) fn begin_finalize(&mut self) {
        self.emit_allowed = false;
    }

    /// Look up a symbol visible in the current scope.
    pub fn get(&self, name: &str) -> Result<Value, AsmError> {
        self.stack.lookup(name).cloned()
    }

    /// Bind a symbol in the current scope.
    pub fn inject(&mut self, name: &str, value: Value) -> Result<(), AsmError> {
        self.stack.inject(name, value)
    }

    /// Append a raw statement to the current frame.
    pub fn code(&mut self, stmt: Statement) -> Result<(), AsmError> {
        if !self.emit_allowed {
            return Err(AsmError::EmitDuringFinalize);
        }
        self.stack.emit(stmt);
        Ok(())
    }

    /// Declare registers: one `.reg .<ty>` statement for the
    /// whitespace-separated `names`, each injected into the current scope.
    /// Returns the created symbols in declaration order.
    pub fn reg(&mut self, ty: &str, names: &str) -> Result<Vec<Value>, AsmError> {
        let regs: Vec<Value> = names
            .split_whitespace()
            .map(|n| Value::Reg(RegSym::new(ty, n)))
            .collect();
        if regs.is_empty() {
            return Ok(regs);
        }
        let name_atoms: Vec<Atom> = names.split_whitespace().map(|n| Atom::lit(n)).collect();
        self.code(Statement::new(
            Atom::empty(),
            Atom::lit(format!(".reg .{ty}")),
            vec![Atom::Seq(intersperse(&name_atoms, ", "))],
            true,
            0,
        ))?;
        for (name, value) in names.split_whitespace().zip(&regs) {
            self.inject(name, value.clone())?;
        }
        Ok(regs)
    }

    /// Reserve memory in a state space, with optional array arity and
    /// initializer, and inject the symbol.
    pub fn mem(
        &mut self,
        space: &str,
        ty: &str,
        name: &str,
        array: ArraySpec,
        init: Option<&str>,
    ) -> Result<Value, AsmError> {
        let sym = Value::Mem(MemSym::new(space, ty, name, array, init));
        let mut parts = vec![Atom::lit(format!(".{space}.{ty} ")), Atom::lit(name)];
        match array {
            ArraySpec::None => {}
            ArraySpec::Unbounded => parts.push(Atom::lit("[]")),
            ArraySpec::Fixed(n) => parts.push(Atom::lit(format!("[{n}]"))),
        }
        if let Some(init) = init {
            parts.push(Atom::lit(format!(" = {init}")));
        }
        self.code(Statement::new(Atom::empty(), Atom::Seq(parts), Vec::new(), true, 0))?;
        self.inject(name, sym.clone())?;
        Ok(sym)
    }

    /// Place a branch-target label and inject it.
    pub fn label(&mut self, name: &str) -> Result<Value, AsmError> {
        let sym = Value::Label(LabelSym::new(name));
        self.code(Statement::new(
            Atom::lit(format!("{name}:")),
            Atom::empty(),
            Vec::new(),
            false,
            0,
        ))?;
        self.inject(name, sym.clone())?;
        Ok(sym)
    }

    /// Emit an unguarded operation from a dotted mnemonic.
    pub fn op(&mut self, mnemonic: &str, operands: &[Atom]) -> Result<(), AsmError> {
        Op::parse(mnemonic).emit(self, operands, Guard::none())
    }

    /// Emit a guarded operation from a dotted mnemonic.
    pub fn op_guarded(
        &mut self,
        mnemonic: &str,
        operands: &[Atom],
        guard: Guard,
    ) -> Result<(), AsmError> {
        Op::parse(mnemonic).emit(self, operands, guard)
    }

    /// Open a braced block, run `f` inside it, close the block. Symbols
    /// declared inside are visible to every invocation made before the
    /// close and to none after; on failure the partial frame is discarded
    /// before the error propagates.
    pub fn block(
        &mut self,
        comment: Option<&str>,
        f: impl FnOnce(&mut EmitContext<'_>) -> Result<(), AsmError>,
    ) -> Result<(), AsmError> {
        let depth = self.stack.depth();
        self.stack.push();
        let open = Statement::new(Atom::empty(), Atom::lit("{"), Vec::new(), false, 1);
        let result = self.code(open).and_then(|_| {
            if let Some(c) = comment {
                self.code(Statement::op(Atom::lit(format!("// {c}")), false))?;
            }
            f(self)
        });
        match result {
            Ok(()) => {
                self.code(Statement::new(
                    Atom::empty(),
                    Atom::lit("}"),
                    Vec::new(),
                    false,
                    -1,
                ))?;
                self.stack.pop()
            }
            Err(e) => {
                self.stack.truncate(depth);
                Err(e)
            }
        }
    }

    /// Run `f` as a fragment-function invocation: it sees a snapshot of the
    /// current frame's bindings, and anything it declares stays visible in
    /// this frame after it returns. On failure the invocation's injector is
    /// dropped wherever unwinding left it.
    pub fn invoke(
        &mut self,
        f: impl FnOnce(&mut EmitContext<'_>) -> Result<(), AsmError>,
    ) -> Result<(), AsmError> {
        let id = self.stack.begin_invocation();
        match f(self) {
            Ok(()) => self.stack.end_invocation(id),
            Err(e) => {
                self.stack.force_end_invocation(id);
                Err(e)
            }
        }
    }

    /// Signal that code emitted this pass is stale and the lifecycle must
    /// run again once the current pass completes.
    pub fn flag_stale(&mut self) {
        *self.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Formatter;

    fn render(stack: BlockStack) -> String {
        Formatter::default().format(&stack.into_code()).unwrap()
    }

    #[test]
    fn test_reg_declares_and_injects() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        let mut cx = EmitContext::new(&mut stack, &mut stale);
        let regs = cx.reg("u32", "addend product").unwrap();
        assert_eq!(regs.len(), 2);
        assert!(cx.get("addend").is_ok());
        assert!(cx.get("product").is_ok());
        assert_eq!(render(stack), ".reg .u32 addend, product;");
    }

    #[test]
    fn test_mem_array_and_initializer() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        let mut cx = EmitContext::new(&mut stack, &mut stale);
        cx.mem("shared", "u32", "scratch", ArraySpec::Fixed(12), None)
            .unwrap();
        cx.mem("const", "u32", "lut", ArraySpec::Unbounded, Some("{1, 2}"))
            .unwrap();
        cx.mem("global", "u32", "flag", ArraySpec::None, None).unwrap();
        let out = render(stack);
        assert_eq!(
            out,
            ".shared.u32 scratch[12];\n.const.u32 lut[] = {1, 2};\n.global.u32 flag;"
        );
    }

    #[test]
    fn test_label_prefix_line() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        let mut cx = EmitContext::new(&mut stack, &mut stale);
        cx.label("loop_start").unwrap();
        assert!(matches!(cx.get("loop_start").unwrap(), Value::Label(_)));
        assert_eq!(render(stack), "loop_start:");
    }

    #[test]
    fn test_op_builder_resets_after_emit() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        let mut cx = EmitContext::new(&mut stack, &mut stale);
        let a = cx.reg("u32", "a").unwrap().remove(0);
        let mut op = Op::new();
        op.push("mov").push("u32");
        op.emit(&mut cx, &[Atom::from(&a), Atom::from(0i64)], Guard::none())
            .unwrap();
        // Reusable: the token chain starts empty again.
        op.push("add").push("u32");
        op.emit(
            &mut cx,
            &[Atom::from(&a), Atom::from(&a), Atom::from(1i64)],
            Guard::none(),
        )
        .unwrap();
        assert!(matches!(
            op.emit(&mut cx, &[], Guard::none()),
            Err(AsmError::EmptyOp)
        ));
        let out = render(stack);
        assert!(out.contains("mov.u32 a, 0;"));
        assert!(out.contains("add.u32 a, a, 1;"));
    }

    #[test]
    fn test_guard_polarities() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        let mut cx = EmitContext::new(&mut stack, &mut stale);
        let p = cx.reg("pred", "p1").unwrap().remove(0);
        let r = cx.reg("u32", "r1").unwrap().remove(0);
        cx.op_guarded("bra.uni", &[Atom::lit("done")], Guard::ifp(p.clone()))
            .unwrap();
        cx.op_guarded(
            "mov.u32",
            &[Atom::from(&r), Atom::from(0i64)],
            Guard::ifnotp(p.clone()),
        )
        .unwrap();
        let both = Guard {
            ifp: Some(p.clone()),
            ifnotp: Some(p),
        };
        assert!(matches!(
            cx.op_guarded("mov.u32", &[Atom::from(&r)], both),
            Err(AsmError::ConflictingGuard(ref m)) if m == "mov.u32"
        ));
        let out = render(stack);
        assert!(out.contains("@p1 bra.uni done;"));
        assert!(out.contains("@!p1 mov.u32 r1, 0;"));
    }

    #[test]
    fn test_block_failure_unwinds_stack() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        {
            let mut cx = EmitContext::new(&mut stack, &mut stale);
            let err = cx.block(None, |cx| {
                cx.reg("u32", "tmp")?;
                cx.block(None, |cx| {
                    cx.get("missing")?;
                    Ok(())
                })
            });
            assert!(matches!(err, Err(AsmError::UnresolvedSymbol(_))));
        }
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_invoke_failure_drops_injector() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        {
            let mut cx = EmitContext::new(&mut stack, &mut stale);
            let err = cx.invoke(|cx| cx.get("nope").map(|_| ()));
            assert!(err.is_err());
        }
        assert_eq!(stack.active_injectors(), 0);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_finalize_blocks_emission() {
        let mut stack = BlockStack::new();
        let mut stale = false;
        let mut cx = EmitContext::new(&mut stack, &mut stale);
        cx.begin_finalize();
        assert!(matches!(
            cx.op("mov.u32", &[]),
            Err(AsmError::EmitDuringFinalize)
        ));
    }
}
