//! Fatal configuration errors for the assembly engine.
//!
//! Every error here aborts the whole module build; nothing partial is ever
//! returned to the caller. The only sanctioned retry is the bounded
//! recompilation loop in `module`, which is driven by an explicit staleness
//! flag, not by catching one of these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AsmError {
    #[error("Symbol '{0}' already bound to a different value in this scope")]
    SymbolCollision(String),

    #[error("Symbol '{0}' is not visible in the current scope")]
    UnresolvedSymbol(String),

    #[error("Duplicate namespace key '{0}' contributed by more than one source")]
    DuplicateKey(String),

    #[error("Fragment dependency cycle involving '{0}'")]
    DependencyCycle(String),

    #[error("Recompilation did not stabilize after {0} attempts")]
    TooManyRecompiles(usize),

    #[error("Operation '{0}' sets both guard polarities")]
    ConflictingGuard(String),

    #[error("Operation emitted with no mnemonic tokens")]
    EmptyOp,

    #[error("Deferred value '{0}' still unresolved at render time")]
    UnresolvedDeferred(String),

    #[error("Injector state does not match scope frame on pop")]
    InjectorMismatch,

    #[error("Scope stack popped past the outer frame")]
    StackUnderflow,

    #[error("Statement emitted during the finalize phase")]
    EmitDuringFinalize,

    #[error("Cannot serialize cache key: {0}")]
    CacheKey(#[from] serde_json::Error),
}
