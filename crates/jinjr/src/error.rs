use thiserror::Error;

/// Errors produced while compiling or rendering a template.
///
/// Variants map 1:1 to the failure classes of the engine: the compiler
/// pipeline (lex/syntax/compile/optimize), the runtime (type, lookup, bound,
/// arity) and the collaborators (filesystem, JSON). Every message is fully
/// formatted at the failure site, including source coordinates and a code
/// snippet where one is available (see [`crate::diagnostic`]).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed token, unterminated literal, unterminated raw block.
    #[error("{0}")]
    Lex(String),

    /// Unexpected token or a compile-time bound overflow.
    #[error("{0}")]
    Syntax(String),

    /// Semantically invalid construct: unknown keyword in the current scope,
    /// a variable where a constant expression is required, a rejected
    /// default-value type.
    #[error("{0}")]
    Compile(String),

    /// Constant folding failure (fold-time division by zero, string*string).
    #[error("{0}")]
    Optimize(String),

    /// An operation is not defined for the value types it was given, or a
    /// coercion failed.
    #[error("{0}")]
    RuntimeType(String),

    /// A name did not resolve: missing upvalue, attribute, function.
    #[error("{0}")]
    RuntimeLookup(String),

    /// A runtime bound was exceeded: index out of range, nesting too deep,
    /// stack overflow.
    #[error("{0}")]
    RuntimeBound(String),

    /// Argument count does not fit the callee's prototype.
    #[error("{0}")]
    RuntimeArity(String),

    /// Virtual filesystem failure.
    #[error("{0}")]
    Io(String),

    /// JSON decode failure (include-with-data).
    #[error("{0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, Error>;
