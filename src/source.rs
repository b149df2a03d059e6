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

//! Configuration sources: the narrow `load`/`save` contract over concrete
//! formats.
//!
//! File sources read YAML first and fall back to JSON, with transparent
//! variable interpolation applied to the raw text before parsing. Format
//! grammar beyond that is owned by the parsers themselves and is out of
//! scope here.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use crate::interpolation::{InterpolationError, Interpolator};
use crate::tree::ConfigTree;

/// A source of hierarchical configuration data.
pub trait ConfigSource: Send + Sync {
    /// Load the source into a configuration tree.
    fn load(&self) -> anyhow::Result<ConfigTree>;

    /// Persist a configuration tree back to the source, where supported.
    fn save(&self, _tree: &ConfigTree) -> anyhow::Result<()> {
        anyhow::bail!("this configuration source does not support saving")
    }

    /// Last modification time of the backing data, where known. Used by
    /// reload detection.
    fn last_modified(&self) -> Option<SystemTime> {
        None
    }
}

fn parse_document(text: &str, origin: &str) -> anyhow::Result<ConfigTree> {
    // Try YAML first, then JSON
    let value = match serde_yaml::from_str::<Value>(text) {
        Ok(value) => value,
        Err(yaml_err) => match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(json_err) => {
                anyhow::bail!(
                    "failed to parse '{origin}': YAML error: {yaml_err}, JSON error: {json_err}"
                );
            }
        },
    };
    Ok(ConfigTree::from_value(&value))
}

/// A YAML/JSON file on disk, read through an interpolator.
pub struct FileSource {
    path: PathBuf,
    interpolator: Arc<Interpolator>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interpolator: Arc::new(Interpolator::with_defaults()),
        }
    }

    pub fn with_interpolator(mut self, interpolator: Arc<Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> anyhow::Result<ConfigTree> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read configuration file '{}'", self.path.display()))?;
        let interpolated = self.interpolator.interpolate(&content)?;
        parse_document(&interpolated, &self.path.display().to_string())
    }

    fn save(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(&tree.to_value())?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write configuration file '{}'", self.path.display()))
    }

    fn last_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).ok()?.modified().ok()
    }
}

/// A YAML/JSON document held in memory.
pub struct InMemorySource {
    text: String,
    interpolator: Arc<Interpolator>,
}

impl InMemorySource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            interpolator: Arc::new(Interpolator::with_defaults()),
        }
    }

    pub fn with_interpolator(mut self, interpolator: Arc<Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }
}

impl ConfigSource for InMemorySource {
    fn load(&self) -> anyhow::Result<ConfigTree> {
        let interpolated = self.interpolator.interpolate(&self.text)?;
        parse_document(&interpolated, "<in-memory>")
    }
}

/// A pre-built configuration tree served as-is.
pub struct TreeSource {
    tree: Mutex<ConfigTree>,
}

impl TreeSource {
    pub fn new(tree: ConfigTree) -> Self {
        Self {
            tree: Mutex::new(tree),
        }
    }

    /// Replace the served tree. Subsequent loads observe the new content.
    pub fn replace(&self, tree: ConfigTree) {
        *self.tree.lock().unwrap_or_else(PoisonError::into_inner) = tree;
    }
}

impl ConfigSource for TreeSource {
    fn load(&self) -> anyhow::Result<ConfigTree> {
        Ok(self
            .tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Process environment variables as a flat configuration tree, optionally
/// restricted to a name prefix (which is stripped from the keys).
pub struct EnvSource {
    prefix: Option<String>,
}

impl EnvSource {
    pub fn new() -> Self {
        Self { prefix: None }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for EnvSource {
    fn load(&self) -> anyhow::Result<ConfigTree> {
        let mut tree = ConfigTree::new();
        for (name, value) in env::vars() {
            let key = match &self.prefix {
                Some(prefix) => match name.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest.trim_start_matches('_').to_string(),
                    None => continue,
                },
                None => name,
            };
            if key.is_empty() {
                continue;
            }
            tree.root_mut()
                .add_child(crate::tree::ConfigNode::leaf(key, value));
        }
        Ok(tree)
    }
}

/// Deserialize YAML with automatic variable interpolation.
///
/// Provides a typed view over configuration text for any type implementing
/// `Deserialize`; `${VAR}` and `${VAR:-default}` references are replaced
/// before deserialization.
pub fn from_yaml_str<T: DeserializeOwned>(s: &str) -> anyhow::Result<T> {
    let interpolated = interpolate_default(s)?;
    Ok(serde_yaml::from_str(&interpolated)?)
}

/// Deserialize JSON with automatic variable interpolation.
pub fn from_json_str<T: DeserializeOwned>(s: &str) -> anyhow::Result<T> {
    let interpolated = interpolate_default(s)?;
    Ok(serde_json::from_str(&interpolated)?)
}

fn interpolate_default(s: &str) -> Result<String, InterpolationError> {
    Interpolator::with_defaults().interpolate(s)
}
