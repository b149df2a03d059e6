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

//! Variable interpolation with pluggable lookups.
//!
//! Configuration text and builder patterns may reference variables using
//! POSIX-style syntax:
//! - `${VAR_NAME}` - simple substitution
//! - `${VAR_NAME:-default}` - substitution with a default when unset/empty
//!
//! Resolution is driven by an ordered chain of [`Lookup`] sources: process
//! environment, static maps, an already-built configuration tree, or custom
//! closures. The first lookup returning a non-empty value wins.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use crate::tree::ConfigTree;

/// Maximum length for interpolated strings to prevent runaway substitution.
const MAX_INTERPOLATED_LENGTH: usize = 10_000_000; // 10MB

lazy_static! {
    /// Regex pattern for matching variable references.
    /// Captures:
    /// - Group 1: Variable name (POSIX naming plus `.` and `-` for
    ///   configuration keys)
    /// - Group 2: Full default syntax (:-default) if present
    /// - Group 3: Default value (everything after :-) if present
    static ref VAR_PATTERN: Regex = Regex::new(
        r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)(:-([^}]*))?\}"
    ).expect("Invalid regex pattern");
}

/// Errors that can occur during variable interpolation.
#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("variable '{name}' is not set and has no default value")]
    MissingVariable { name: String },

    #[error("interpolated result exceeds maximum allowed length of {MAX_INTERPOLATED_LENGTH} bytes")]
    ResultTooLarge,
}

/// One source of variable values.
pub trait Lookup: Send + Sync {
    /// Resolve a variable name. `None` means this lookup has no value and
    /// the next lookup in the chain is consulted.
    fn lookup(&self, name: &str) -> Option<String>;
}

impl<F> Lookup for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn lookup(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Resolves variables from the process environment.
pub struct EnvLookup;

impl Lookup for EnvLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// Resolves variables from a static map.
pub struct MapLookup {
    values: HashMap<String, String>,
}

impl MapLookup {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl<S: Into<String>> FromIterator<(S, S)> for MapLookup {
    fn from_iter<T: IntoIterator<Item = (S, S)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Lookup for MapLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Resolves variables against an already-built configuration tree using
/// dotted-key addressing.
pub struct TreeLookup {
    tree: Arc<ConfigTree>,
}

impl TreeLookup {
    pub fn new(tree: Arc<ConfigTree>) -> Self {
        Self { tree }
    }
}

impl Lookup for TreeLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        self.tree.get_string(name)
    }
}

/// An ordered chain of lookups driving `${...}` substitution.
#[derive(Clone, Default)]
pub struct Interpolator {
    lookups: Vec<Arc<dyn Lookup>>,
}

impl Interpolator {
    /// Create an interpolator with no lookups. Every unresolved variable
    /// falls through to its default, or is reported missing / left literal.
    pub fn new() -> Self {
        Self {
            lookups: Vec::new(),
        }
    }

    /// Create an interpolator resolving from the process environment, the
    /// conventional default chain.
    pub fn with_defaults() -> Self {
        Self::new().with_lookup(Arc::new(EnvLookup))
    }

    /// Append a lookup to the chain. Earlier lookups take precedence.
    pub fn with_lookup(mut self, lookup: Arc<dyn Lookup>) -> Self {
        self.lookups.push(lookup);
        self
    }

    pub fn add_lookup(&mut self, lookup: Arc<dyn Lookup>) {
        self.lookups.push(lookup);
    }

    /// Resolve a single variable through the chain. Empty values count as
    /// unresolved so that defaults apply.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.lookups
            .iter()
            .find_map(|l| l.lookup(name))
            .filter(|v| !v.is_empty())
    }

    /// Interpolate all variables in the input. A variable with no value and
    /// no default is an error.
    pub fn interpolate(&self, input: &str) -> Result<String, InterpolationError> {
        self.substitute(input, true)
    }

    /// Interpolate all variables in the input, leaving unresolved
    /// references as literal text instead of erroring. Used for builder
    /// patterns, where an unresolved key simply names a source that does
    /// not exist.
    pub fn interpolate_lenient(&self, input: &str) -> Result<String, InterpolationError> {
        self.substitute(input, false)
    }

    fn substitute(&self, input: &str, strict: bool) -> Result<String, InterpolationError> {
        let mut result = String::with_capacity(input.len());
        let mut last_match_end = 0;
        let mut variables_used = Vec::new();

        for caps in VAR_PATTERN.captures_iter(input) {
            let full_match = match caps.get(0) {
                Some(m) => m,
                None => continue,
            };
            let var_name = match caps.get(1) {
                Some(m) => m.as_str(),
                None => continue,
            };
            let default_value = caps.get(3).map(|m| m.as_str());

            result.push_str(&input[last_match_end..full_match.start()]);

            match self.resolve(var_name) {
                Some(value) => {
                    variables_used.push(var_name);
                    result.push_str(&value);
                }
                None => match default_value {
                    Some(default) => result.push_str(default),
                    None if strict => {
                        return Err(InterpolationError::MissingVariable {
                            name: var_name.to_string(),
                        });
                    }
                    None => result.push_str(full_match.as_str()),
                },
            }
            last_match_end = full_match.end();

            if result.len() > MAX_INTERPOLATED_LENGTH {
                return Err(InterpolationError::ResultTooLarge);
            }
        }

        result.push_str(&input[last_match_end..]);

        // Log which variables were interpolated (names only, not values)
        if !variables_used.is_empty() {
            debug!("interpolated variables: {}", variables_used.join(", "));
        }

        Ok(result)
    }
}

/// Interpolate environment variables in the input string using the default
/// lookup chain.
pub fn interpolate_env(input: &str) -> Result<String, InterpolationError> {
    Interpolator::with_defaults().interpolate(input)
}
