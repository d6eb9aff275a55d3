//! Error types for Converge.
//!
//! Only structural failures travel through [`Error`]: an unknown module, a
//! condition that does not parse, a loop expression that cannot be resolved.
//! Failures of an individual host are never returned as an `Err`; they are
//! recorded in that host's [`TaskResult`](crate::executor::task::TaskResult).

use thiserror::Error;

/// Result type alias for Converge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Converge.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// Module not found in the registry.
    #[error("Module '{0}' not found")]
    ModuleNotFound(String),

    /// Invalid module arguments.
    #[error("Invalid arguments for module '{module}': {message}")]
    ModuleArgs {
        /// Module name
        module: String,
        /// Error message
        message: String,
    },

    /// A condition expression could not be parsed.
    #[error("Invalid condition '{expression}': {message}")]
    ConditionSyntax {
        /// The offending expression
        expression: String,
        /// Error message
        message: String,
    },

    /// A condition parsed but could not be evaluated.
    #[error("Failed to evaluate condition '{expression}': {message}")]
    ConditionEval {
        /// The offending expression
        expression: String,
        /// Error message
        message: String,
    },

    /// A loop expression could not be resolved to a sequence.
    #[error("Invalid loop expression '{expression}': {message}")]
    LoopExpression {
        /// The loop expression as written
        expression: String,
        /// Error message
        message: String,
    },

    /// Handler registration was rejected.
    #[error("Invalid handler: {0}")]
    HandlerValidation(String),

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Template rendering error.
    #[error("Template rendering failed for '{template}': {message}")]
    TemplateRender {
        /// Template source
        template: String,
        /// Error message
        message: String,
    },

    /// Failed to reach a host.
    #[error("Failed to connect to '{host}': {message}")]
    Connection {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// The run was cancelled or its deadline expired.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inventory lookup failed.
    #[error("Inventory error: {0}")]
    Inventory(String),

    // ========================================================================
    // IO / Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new module args error.
    pub fn module_args(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleArgs {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Creates a new condition syntax error.
    pub fn condition_syntax(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConditionSyntax {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Creates a new condition evaluation error.
    pub fn condition_eval(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConditionEval {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Creates a new loop expression error.
    pub fn loop_expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoopExpression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Creates a new template render error.
    pub fn template_render(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateRender {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error aborts a task before any dispatch.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::ModuleNotFound(_)
                | Error::ModuleArgs { .. }
                | Error::ConditionSyntax { .. }
                | Error::LoopExpression { .. }
        )
    }

    /// Returns the error code for a process exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ModuleNotFound(_) | Error::ModuleArgs { .. } => 4,
            Error::ConditionSyntax { .. } | Error::LoopExpression { .. } => 4,
            Error::Connection { .. } => 3,
            Error::Cancelled(_) => 130,
            _ => 1,
        }
    }
}
