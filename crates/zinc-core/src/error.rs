//! Unified error types for the Zinc context runtime.
//!
//! Registration operations fail fast with a [`ContextError`]; listener
//! failures surface as an [`EventError`] and travel back to whoever started
//! the dispatch.

use thiserror::Error;

use crate::context::ContextId;
use crate::resolver::ModuleKind;

/// Boxed error used for user-supplied callbacks (installs, listeners, actions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Event Errors
// =============================================================================

/// Errors produced while emitting events.
#[derive(Debug, Error)]
pub enum EventError {
    /// A listener returned an error; the remaining listeners were skipped.
    #[error("listener for '{event}' failed: {source}")]
    Listener {
        /// The event being emitted.
        event: String,
        /// The error returned by the listener.
        #[source]
        source: BoxError,
    },

    /// The event name is empty or contains whitespace.
    #[error("invalid event name: {0:?}")]
    InvalidName(String),
}

impl EventError {
    pub(crate) fn listener(event: &str, source: BoxError) -> Self {
        Self::Listener {
            event: event.to_string(),
            source,
        }
    }
}

// =============================================================================
// Context Errors
// =============================================================================

/// Errors raised synchronously by context registration operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A command was declared without a name.
    #[error("command name must not be empty")]
    EmptyCommandName,

    /// A parent segment of a command path is not registered.
    #[error("parent command not found: {path}")]
    UnknownParentCommand {
        /// The unresolved parent path.
        path: String,
    },

    /// A command with the same name already exists in the same scope.
    #[error("command '{name}' is already registered in this scope")]
    CommandExists {
        /// The duplicate command name.
        name: String,
    },

    /// The argument part of a command declaration could not be parsed.
    #[error("invalid command declaration '{decl}': {reason}")]
    InvalidDeclaration {
        /// The full declaration.
        decl: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The session lacks the roles required by the command.
    #[error("permission denied for command '{0}'")]
    PermissionDenied(String),

    /// Input did not satisfy the command's argument declarations.
    #[error("bad arguments for '{command}': {reason}")]
    BadArguments {
        /// The command name.
        command: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The command action returned an error.
    #[error("command '{command}' failed: {source}")]
    CommandFailed {
        /// The command name.
        command: String,
        /// The action error.
        #[source]
        source: BoxError,
    },

    /// A service with the same key is already registered.
    #[error("service '{0}' is already registered")]
    ServiceExists(String),

    /// The service key collides with a reserved runtime attribute.
    #[error("service key '{0}' is reserved by the runtime")]
    ReservedServiceKey(String),

    /// No adapter constructor could be resolved for the protocol.
    #[error("no adapter found for protocol '{0}'")]
    AdapterNotFound(String),

    /// An adapter for the protocol is already registered.
    #[error("adapter for protocol '{0}' is already registered")]
    AdapterExists(String),

    /// An adapter failed to start.
    #[error("adapter '{protocol}' failed to start: {source}")]
    AdapterStart {
        /// The adapter protocol.
        protocol: String,
        /// The start error.
        #[source]
        source: BoxError,
    },

    /// The module resolver could not find the requested module.
    #[error("{kind} module '{name}' not found")]
    ModuleNotFound {
        /// What kind of module was requested.
        kind: ModuleKind,
        /// The requested name.
        name: String,
    },

    /// A plugin's install function failed; the mount was rolled back.
    #[error("failed to install plugin '{plugin}': {source}")]
    PluginInstall {
        /// The plugin's full name.
        plugin: String,
        /// The install error.
        #[source]
        source: BoxError,
    },

    /// A constructor supplied for a service or adapter failed.
    #[error("failed to construct '{key}': {source}")]
    Construct {
        /// The service key or adapter protocol.
        key: String,
        /// The constructor error.
        #[source]
        source: BoxError,
    },

    /// The context has already been disposed.
    #[error("context {0} has been disposed")]
    Disposed(ContextId),

    /// Timers need an ambient tokio runtime.
    #[error("no tokio runtime available to schedule timers")]
    NoRuntime,

    /// Event emission error.
    #[error(transparent)]
    Event(#[from] EventError),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for context operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Result type for event emission.
pub type EventResult<T> = Result<T, EventError>;
