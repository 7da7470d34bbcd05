//! Error types for graph evaluation.

use std::fmt;
use std::sync::Arc;

/// Errors produced while evaluating or mutating the dependency graph.
///
/// User errors can be propagated out of derived computations with the `?`
/// operator, which converts any `Into<anyhow::Error>` type into
/// [`AtomError::Computation`].
#[derive(Debug, Clone)]
pub enum AtomError {
    /// A mutating environment operation was invoked from inside a running
    /// computation.
    ///
    /// Derived computations may only read, through the tracker they are
    /// given. Writing, dispatching, subscribing, or opening a transaction
    /// mid-computation would observe a half-updated graph, so the operation
    /// is rejected and the graph is left untouched.
    Scope {
        /// The operation that was rejected.
        operation: &'static str,
    },

    /// A node transitively read itself during one recomputation.
    ///
    /// The `path` holds the display names of the nodes forming the cycle,
    /// ending with the node that closed it.
    Cycle {
        /// Names of the nodes forming the cycle.
        path: Vec<String>,
    },

    /// A computation function failed.
    ///
    /// The failing node's cache entry is left unchanged, so a later read
    /// re-attempts the computation.
    Computation(Arc<anyhow::Error>),
}

impl AtomError {
    /// Returns the inner error if this is a [`AtomError::Computation`].
    pub fn computation(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            AtomError::Computation(err) => Some(err),
            _ => None,
        }
    }

    /// Attempts to downcast a computation error to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.computation()?.downcast_ref::<E>()
    }

    /// Returns `true` if this is a computation error of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if this is a cycle error.
    pub fn is_cycle(&self) -> bool {
        matches!(self, AtomError::Cycle { .. })
    }
}

impl fmt::Display for AtomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomError::Scope { operation } => {
                write!(f, "`{operation}` called during an active computation")
            }
            AtomError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            AtomError::Computation(err) => write!(f, "computation failed: {err}"),
        }
    }
}

// `AtomError` deliberately does not implement `std::error::Error`, which
// keeps this blanket conversion coherent.
impl<E: Into<anyhow::Error>> From<E> for AtomError {
    fn from(err: E) -> Self {
        AtomError::Computation(Arc::new(err.into()))
    }
}
