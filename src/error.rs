// Copyright 2025 The Config Weaver Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy for the builder orchestration layer.
//!
//! Collaborator failures (file I/O, parse errors) arrive as opaque
//! [`anyhow::Error`] values and are chained as the source of a
//! [`BuilderError`], so callers always see the original cause.

/// Unified error type for builder orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    /// `get_configuration` was called on a combined builder with no
    /// definition builder configured.
    #[error("no definition builder has been configured")]
    MissingDefinitionBuilder,

    /// A declaration tag had no registered provider and no custom provider
    /// matched.
    #[error("no provider registered for declaration tag '{tag}'")]
    ProviderNotFound { tag: String },

    /// Reloading was requested for a declaration whose provider has no
    /// reloading-capable builder implementation.
    #[error("reloading requested for tag '{tag}' but its provider does not support reloading")]
    ReloadingUnsupported { tag: String },

    /// A reserved declaration attribute carried a value that could not be
    /// parsed. Raised when the value is read, not when the declaration is
    /// constructed.
    #[error("declaration attribute '{attribute}' has malformed value '{value}'")]
    MalformedDeclaration { attribute: String, value: String },

    /// Applying registered parameter defaults to a child parameter set
    /// failed.
    #[error("failed to apply configuration defaults")]
    RuntimeConfiguration(#[source] anyhow::Error),

    /// A multi-source builder was asked to resolve a managed builder without
    /// a file-identifier pattern.
    #[error("multi-source builder has no file identifier pattern")]
    MissingPattern,

    /// A registry or cache operation received a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutation was attempted on a read-only object.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Building a non-optional child configuration failed. The original
    /// failure is chained as the source.
    #[error("building child configuration '{name}' failed")]
    ChildBuildFailed {
        name: String,
        #[source]
        source: Box<BuilderError>,
    },

    /// A configuration source collaborator failed to load or save.
    #[error("configuration source error")]
    Source(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BuilderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_failure_chains_original_cause() {
        let inner = BuilderError::ProviderNotFound {
            tag: "xml".to_string(),
        };
        let outer = BuilderError::ChildBuildFailed {
            name: "base".to_string(),
            source: Box::new(inner),
        };

        let source = std::error::Error::source(&outer).expect("source must be chained");
        assert!(source.to_string().contains("xml"));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BuilderError::MissingPattern.to_string(),
            "multi-source builder has no file identifier pattern"
        );
        let err = BuilderError::MalformedDeclaration {
            attribute: "optional".to_string(),
            value: "maybe".to_string(),
        };
        assert!(err.to_string().contains("'optional'"));
        assert!(err.to_string().contains("'maybe'"));
    }
}
