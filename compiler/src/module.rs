//! Module assembly: the fixed lifecycle and the bounded recompile loop.
//!
//! A build resolves its fragments once, merges every namespace
//! contribution into one flat table, then runs the lifecycle:
//! header directives, `module_setup` in global order, one scoped block per
//! entry (parameters bound, dependency `entry_setup` in order, body,
//! `entry_teardown` in reverse order), then `finalize_code` with emission
//! disabled. Any fragment may flag the pass stale, which reruns the
//! lifecycle on a fresh scope stack with the same instances, up to
//! `max_compiles` attempts. A fixed fragment and entry set always yields
//! the same emission order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::EmitContext;
use crate::error::AsmError;
use crate::format::Formatter;
use crate::fragment::{Entry, EntryHandle, Fragment, FragmentKind};
use crate::resolve::{resolve, Resolved};
use crate::scope::BlockStack;
use crate::stmt::{intersperse, Atom, Statement};
use crate::symbol::{RegSym, Value};

/// Knobs for one module build. Serializable so callers can derive cache
/// keys from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// PTX ISA version directive.
    pub version: String,
    /// Target architecture directive.
    pub target: String,
    /// Include fragments' self-test entries in the module.
    pub build_tests: bool,
    /// Upper bound on lifecycle passes before a staleness signal is
    /// treated as divergence.
    pub max_compiles: usize,
    /// Indent width handed to the default formatter.
    pub indent: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            version: "2.1".to_string(),
            target: "sm_20".to_string(),
            build_tests: false,
            max_compiles: 10,
            indent: 4,
        }
    }
}

/// Builder for a [`PtxModule`].
pub struct ModuleBuilder {
    entries: Vec<EntryHandle>,
    inject: Vec<(String, Value)>,
    options: BuildOptions,
    formatter: Option<Formatter>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            inject: Vec::new(),
            options: BuildOptions::default(),
            formatter: None,
        }
    }

    pub fn entry(mut self, handle: EntryHandle) -> Self {
        self.entries.push(handle);
        self
    }

    /// Pre-existing bindings (e.g. tuning constants) merged into the
    /// module namespace alongside fragment contributions.
    pub fn inject(mut self, name: &str, value: Value) -> Self {
        self.inject.push((name.to_string(), value));
        self
    }

    pub fn build_tests(mut self, yes: bool) -> Self {
        self.options.build_tests = yes;
        self
    }

    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn build(self) -> Result<PtxModule, AsmError> {
        let mut resolved = resolve(&self.entries, self.options.build_tests)?;

        // One flat namespace; a key from two sources fails before any
        // statement is emitted.
        let mut namespace: BTreeMap<String, Value> = BTreeMap::new();
        for (name, value) in &self.inject {
            merge_binding(&mut namespace, name, value.clone())?;
        }
        for &idx in &resolved.global_order {
            for (name, value) in resolved.fragments[idx].namespace() {
                merge_binding(&mut namespace, &name, value)?;
            }
        }
        for entry in &resolved.entries {
            for (name, value) in entry.namespace() {
                merge_binding(&mut namespace, &name, value)?;
            }
        }

        let mut compiles = 0;
        let code = loop {
            compiles += 1;
            let mut stack = BlockStack::new();
            let mut stale = false;
            let pass = run_pass(
                &mut resolved,
                &namespace,
                &self.options,
                &mut stack,
                &mut stale,
            );
            if let Err(e) = pass {
                stack.truncate(1);
                return Err(e);
            }
            debug_assert_eq!(stack.depth(), 1);
            if !stale {
                break stack.into_code();
            }
            // The staleness signal on pass N is the Nth signal; one more
            // signal than the attempt budget means the build is diverging.
            if compiles > self.options.max_compiles {
                return Err(AsmError::TooManyRecompiles(compiles));
            }
        };

        let formatter = self
            .formatter
            .unwrap_or_else(|| Formatter::new(self.options.indent));
        let source = formatter.format(&code)?;

        let Resolved {
            fragments,
            global_order,
            entries,
            tests,
            ..
        } = resolved;
        let mut ordered: Vec<Option<Box<dyn Fragment>>> =
            fragments.into_iter().map(Some).collect();
        let fragments = global_order
            .iter()
            .map(|&i| ordered[i].take().expect("global order visits each index once"))
            .collect();
        let tests = tests.iter().map(|&i| entries[i].name().to_string()).collect();

        Ok(PtxModule {
            source,
            fragments,
            entries,
            tests,
            compiles,
        })
    }
}

/// The immutable result of a successful build.
pub struct PtxModule {
    /// Rendered PTX source.
    pub source: String,
    /// Fragment instances in global dependency order, for the caller's
    /// scheduling (device init and the like).
    pub fragments: Vec<Box<dyn Fragment>>,
    /// Entries in emission order, self-tests included.
    pub entries: Vec<Box<dyn Entry>>,
    /// Names of the entries that are self-tests.
    pub tests: Vec<String>,
    /// Lifecycle passes executed before the build stabilized.
    pub compiles: usize,
}

impl PtxModule {
    pub fn fragment_kinds(&self) -> Vec<FragmentKind> {
        self.fragments.iter().map(|f| f.kind()).collect()
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }
}

fn merge_binding(
    namespace: &mut BTreeMap<String, Value>,
    name: &str,
    value: Value,
) -> Result<(), AsmError> {
    if namespace.contains_key(name) {
        return Err(AsmError::DuplicateKey(name.to_string()));
    }
    namespace.insert(name.to_string(), value);
    Ok(())
}

fn run_pass(
    resolved: &mut Resolved,
    namespace: &BTreeMap<String, Value>,
    options: &BuildOptions,
    stack: &mut BlockStack,
    stale: &mut bool,
) -> Result<(), AsmError> {
    for (name, value) in namespace {
        stack.inject(name, value.clone())?;
    }
    stack.emit(Statement::directive(&format!(".version {}", options.version)));
    stack.emit(Statement::directive(&format!(".target {}", options.target)));

    let mut cx = EmitContext::new(stack, stale);

    for &idx in &resolved.global_order {
        let frag = &mut resolved.fragments[idx];
        cx.invoke(|cx| frag.module_setup(cx))?;
    }

    for (ent_idx, entry) in resolved.entries.iter_mut().enumerate() {
        let params: Vec<RegSym> = entry
            .params()
            .iter()
            .map(|(ty, name)| RegSym::new(&format!(".param.{ty}"), name))
            .collect();
        let mut decl: Vec<Atom> = vec![Atom::lit("(")];
        let param_atoms: Vec<Atom> = params
            .iter()
            .map(|r| Atom::lit(format!("{} {}", r.ty, r.name)))
            .collect();
        decl.extend(intersperse(&param_atoms, ", "));
        decl.push(Atom::lit(")"));
        cx.code(Statement::new(
            Atom::empty(),
            Atom::lit(format!(".entry {}", entry.entry_name())),
            vec![Atom::Seq(decl)],
            false,
            0,
        ))?;

        let deps = &resolved.entry_deps[ent_idx];
        let fragments = &mut resolved.fragments;
        cx.block(None, |cx| {
            for reg in &params {
                cx.inject(&reg.name, Value::Reg(reg.clone()))?;
            }
            for &dep in deps {
                let frag = &mut fragments[dep];
                cx.invoke(|cx| frag.entry_setup(cx))?;
            }
            cx.invoke(|cx| entry.entry_setup(cx))?;
            cx.invoke(|cx| entry.body(cx))?;
            cx.invoke(|cx| entry.entry_teardown(cx))?;
            for &dep in deps.iter().rev() {
                let frag = &mut fragments[dep];
                cx.invoke(|cx| frag.entry_teardown(cx))?;
            }
            Ok(())
        })?;
    }

    cx.begin_finalize();
    for &idx in &resolved.global_order {
        let frag = &mut resolved.fragments[idx];
        cx.invoke(|cx| frag.finalize_code(cx))?;
    }
    Ok(())
}
