use thiserror::Error;

/// Unified error type for the phaseflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid engine or runtime configuration
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Graph validation failed before any node was started
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        element: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A capacity limit was reached at submission time
    #[error("Resource exhausted: {resource} (current: {current}, limit: {limit})")]
    ResourceExhaustion {
        resource: String,
        current: u64,
        limit: u64,
        details: Option<String>,
    },

    /// A thread pool refused new work
    #[error("Submission rejected by {pool} pool: {reason}")]
    Rejected { pool: String, reason: String },

    /// Phase init/pre-execute/post-execute failure
    #[error("Phase {phase} {stage} failed")]
    PhaseLifecycle {
        phase: i32,
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Graph-level lifecycle failure (pre/post execute, commit, rollback)
    #[error("Graph {stage} failed")]
    GraphLifecycle {
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operator-requested cancellation
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// A scheduler channel closed under a sender
    #[error("Channel {channel} closed: {message}")]
    Channel { channel: String, message: String },

    /// IO errors (config files)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Config document could not be parsed
    #[error("Could not parse {format} document")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Panics and other failures with no better home
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl EngineError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(
        message: S,
        field: F,
        actual: impl ToString,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
            expected: None,
            actual: Some(actual.to_string()),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            element: None,
            source: None,
        }
    }

    /// Create a validation error attached to a graph element
    pub fn validation_element<S: Into<String>, E: Into<String>>(message: S, element: E) -> Self {
        Self::Validation {
            message: message.into(),
            element: Some(element.into()),
            source: None,
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_exhausted<S: Into<String>>(resource: S, current: u64, limit: u64) -> Self {
        Self::ResourceExhaustion {
            resource: resource.into(),
            current,
            limit,
            details: None,
        }
    }

    /// Attach details to a resource exhaustion error
    pub fn with_details<D: Into<String>>(mut self, text: D) -> Self {
        if let Self::ResourceExhaustion { ref mut details, .. } = self {
            *details = Some(text.into());
        }
        self
    }

    /// Create a pool rejection error
    pub fn rejected<P: Into<String>, R: Into<String>>(pool: P, reason: R) -> Self {
        Self::Rejected {
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    /// Create a phase lifecycle error
    pub fn phase_lifecycle<S: Into<String>>(phase: i32, stage: S, source: anyhow::Error) -> Self {
        Self::PhaseLifecycle {
            phase,
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Create a graph lifecycle error
    pub fn graph_lifecycle<S: Into<String>>(stage: S, source: anyhow::Error) -> Self {
        Self::GraphLifecycle {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Create a channel error
    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Short label used as a log field
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Validation { .. } => "validation",
            Self::ResourceExhaustion { .. } => "resource",
            Self::Rejected { .. } => "rejected",
            Self::PhaseLifecycle { .. } => "phase",
            Self::GraphLifecycle { .. } => "graph",
            Self::Cancelled { .. } => "cancelled",
            Self::Channel { .. } => "channel",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

/// Macro for creating errors tersely
#[macro_export]
macro_rules! engine_error {
    (configuration, $message:expr) => {
        $crate::EngineError::configuration($message)
    };
    (validation, $message:expr) => {
        $crate::EngineError::validation($message)
    };
    (validation, $message:expr, $element:expr) => {
        $crate::EngineError::validation_element($message, $element)
    };
    (resource, $resource:expr, $current:expr, $limit:expr) => {
        $crate::EngineError::resource_exhausted($resource, $current, $limit)
    };
    (rejected, $pool:expr, $reason:expr) => {
        $crate::EngineError::rejected($pool, $reason)
    };
}
