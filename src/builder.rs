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

//! The configuration-builder contract and the leaf source-backed builder.
//!
//! A builder produces an immutable configuration tree on demand and caches it
//! until the result is reset, either explicitly or because an attached reload
//! controller latched into the reloading state. Published results are
//! `Arc<ConfigTree>` and never mutated again.

use log::{debug, warn};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::Result;
use crate::event::BuilderListener;
use crate::parameters::ParameterSet;
use crate::reload::{ReloadHandle, ReloadingController};
use crate::source::ConfigSource;
use crate::tree::ConfigTree;

impl std::fmt::Debug for dyn ConfigurationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfigurationBuilder")
    }
}

/// A producer of configuration trees with result caching and reset.
pub trait ConfigurationBuilder: Send + Sync {
    /// The built configuration. Builds on first access, then returns the
    /// cached result until it is reset.
    fn get_configuration(&self) -> Result<Arc<ConfigTree>>;

    /// Discard the cached result so the next access rebuilds it.
    fn reset_result(&self);

    /// Discard the cached result and any internal builder caches.
    fn reset(&self) {
        self.reset_result();
    }

    /// The reload handle for this builder, when it is reload-capable.
    fn reload_handle(&self) -> Option<Arc<dyn ReloadHandle>> {
        None
    }
}

/// A builder backed by a single [`ConfigSource`].
///
/// When a reload controller is attached, a latched reloading state discards
/// the cached result before the next access, and a successful rebuild clears
/// the latch.
pub struct SourceBuilder {
    source: Arc<dyn ConfigSource>,
    params: ParameterSet,
    controller: Option<Arc<ReloadingController>>,
    allow_fail_on_init: bool,
    result: RwLock<Option<Arc<ConfigTree>>>,
}

impl SourceBuilder {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            params: ParameterSet::new(),
            controller: None,
            allow_fail_on_init: false,
            result: RwLock::new(None),
        }
    }

    pub fn with_parameters(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }

    pub fn with_controller(mut self, controller: Arc<ReloadingController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Treat a load failure as an empty configuration instead of an error.
    pub fn with_allow_fail_on_init(mut self, allow: bool) -> Self {
        self.allow_fail_on_init = allow;
        self
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    fn cached(&self) -> Option<Arc<ConfigTree>> {
        self.result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
    }

    fn store(&self, result: Option<Arc<ConfigTree>>) {
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = result;
    }
}

impl ConfigurationBuilder for SourceBuilder {
    fn get_configuration(&self) -> Result<Arc<ConfigTree>> {
        if let Some(controller) = &self.controller {
            if controller.is_in_reloading_state() {
                debug!("backing source changed, discarding cached result");
                self.store(None);
            }
        }
        if let Some(result) = self.cached() {
            return Ok(result);
        }

        let tree = match self.source.load() {
            Ok(mut tree) => {
                if let Some(delimiter) = self.params.list_delimiter() {
                    tree.split_lists(delimiter);
                }
                tree
            }
            Err(err) => {
                if self.allow_fail_on_init {
                    warn!("source failed to load, using empty configuration: {err:#}");
                    ConfigTree::new()
                } else {
                    return Err(err.into());
                }
            }
        };

        let result = Arc::new(tree);
        self.store(Some(result.clone()));
        if let Some(controller) = &self.controller {
            controller.reset_reloading_state();
        }
        for listener in self.params.listeners() {
            listener.on_result_created();
        }
        Ok(result)
    }

    fn reset_result(&self) {
        self.store(None);
        for listener in self.params.listeners() {
            listener.on_reset();
        }
    }

    fn reload_handle(&self) -> Option<Arc<dyn ReloadHandle>> {
        self.controller
            .as_ref()
            .map(|c| c.clone() as Arc<dyn ReloadHandle>)
    }
}

/// A builder that always yields an empty configuration. Stands in for an
/// optional, force-created child whose initialization failed.
pub struct EmptyResultBuilder {
    empty: Arc<ConfigTree>,
}

impl EmptyResultBuilder {
    pub fn new() -> Self {
        Self {
            empty: Arc::new(ConfigTree::new()),
        }
    }
}

impl Default for EmptyResultBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationBuilder for EmptyResultBuilder {
    fn get_configuration(&self) -> Result<Arc<ConfigTree>> {
        Ok(self.empty.clone())
    }

    fn reset_result(&self) {}
}
