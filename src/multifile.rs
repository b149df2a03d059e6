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

//! Dynamic multi-source selection.
//!
//! A [`MultiSourceBuilder`] resolves a runtime key by interpolating a
//! configured pattern (e.g. `conf/${tenant}.yaml`), then builds and caches
//! one managed builder per resolved key. The pattern may reference values
//! that require evaluating this same builder's configuration; a per-instance
//! re-entrancy flag makes that recursion terminate by serving an empty
//! configuration to the recursive read instead of looping.

use indexmap::IndexMap;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::builder::{ConfigurationBuilder, SourceBuilder};
use crate::error::{BuilderError, Result};
use crate::interpolation::{Interpolator, Lookup};
use crate::parameters::ParameterSet;
use crate::reload::{
    FileReloadDetector, ReloadAggregator, ReloadHandle, ReloadingController,
    DEFAULT_REFRESH_DELAY,
};
use crate::source::FileSource;
use crate::tree::ConfigTree;

/// Creates the managed builder for one resolved key.
pub trait ManagedBuilderFactory: Send + Sync {
    fn create(
        &self,
        key: &str,
        params: &ParameterSet,
        reloading: bool,
        allow_fail_on_init: bool,
    ) -> Result<Arc<dyn ConfigurationBuilder>>;
}

/// Default factory: the resolved key is a file path.
pub struct FileBuilderFactory;

impl ManagedBuilderFactory for FileBuilderFactory {
    fn create(
        &self,
        key: &str,
        params: &ParameterSet,
        reloading: bool,
        allow_fail_on_init: bool,
    ) -> Result<Arc<dyn ConfigurationBuilder>> {
        let mut builder = SourceBuilder::new(Arc::new(FileSource::new(key)))
            .with_parameters(params.clone())
            .with_allow_fail_on_init(allow_fail_on_init);
        if reloading {
            let delay = params
                .reload_refresh_delay()
                .unwrap_or(DEFAULT_REFRESH_DELAY);
            let detector = Arc::new(FileReloadDetector::new(key, delay));
            builder = builder.with_controller(Arc::new(ReloadingController::new(detector)));
        }
        Ok(Arc::new(builder))
    }
}

struct MultiInner {
    pattern: Option<String>,
    params: ParameterSet,
    interpolator: Option<Arc<Interpolator>>,
    factory: Arc<dyn ManagedBuilderFactory>,
    builders: IndexMap<String, Arc<dyn ConfigurationBuilder>>,
    reloading: bool,
    allow_fail_on_init: bool,
}

/// Selects, builds, and caches one managed builder per resolved key.
pub struct MultiSourceBuilder {
    inner: RwLock<MultiInner>,
    resolving: AtomicBool,
    aggregator: Arc<ReloadAggregator>,
}

impl MultiSourceBuilder {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MultiInner {
                pattern: None,
                params: ParameterSet::new(),
                interpolator: None,
                factory: Arc::new(FileBuilderFactory),
                builders: IndexMap::new(),
                reloading: false,
                allow_fail_on_init: false,
            }),
            resolving: AtomicBool::new(false),
            aggregator: Arc::new(ReloadAggregator::new()),
        }
    }

    pub fn with_pattern(self, pattern: impl Into<String>) -> Self {
        self.write().pattern = Some(pattern.into());
        self
    }

    pub fn with_parameters(self, params: ParameterSet) -> Self {
        self.write().params = params;
        self
    }

    pub fn with_factory(self, factory: Arc<dyn ManagedBuilderFactory>) -> Self {
        self.write().factory = factory;
        self
    }

    /// Wire managed builders with reload controllers registered on the
    /// builder-owned aggregator.
    pub fn with_reloading(self, reloading: bool) -> Self {
        self.write().reloading = reloading;
        self
    }

    pub fn with_allow_fail_on_init(self, allow: bool) -> Self {
        self.write().allow_fail_on_init = allow;
        self
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MultiInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MultiInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the interpolator used for key resolution. Usually installed
    /// after construction so it can hold a [`MultiSourceLookup`] back to
    /// this builder.
    pub fn set_interpolator(&self, interpolator: Arc<Interpolator>) {
        self.write().interpolator = Some(interpolator);
    }

    pub fn reload_aggregator(&self) -> Arc<ReloadAggregator> {
        self.aggregator.clone()
    }

    /// Replace the builder parameters and flush: every cached builder is
    /// dropped (its listeners notified), reload handles are deregistered,
    /// and the cached interpolator is discarded so a fresh one is built on
    /// next use.
    pub fn reset_parameters(&self, params: ParameterSet) {
        let mut inner = self.write();
        for builder in inner.builders.values() {
            builder.reset_result();
        }
        inner.builders.clear();
        inner.interpolator = None;
        inner.params = params;
        self.aggregator.clear();
    }

    /// The managed builder for the currently resolved key, created on first
    /// access per key.
    pub fn managed_builder(&self) -> Result<Arc<dyn ConfigurationBuilder>> {
        let key = self.resolve_key()?;

        let mut inner = self.write();
        if let Some(builder) = inner.builders.get(&key) {
            return Ok(builder.clone());
        }

        debug!("no managed builder for key '{key}', creating one");
        // Parameters are cloned fresh per key so concurrently selected keys
        // never share mutable parameter state
        let params = inner.params.clone();
        let builder =
            inner
                .factory
                .create(&key, &params, inner.reloading, inner.allow_fail_on_init)?;
        if inner.reloading {
            if let Some(handle) = builder.reload_handle() {
                self.aggregator.add_handle(key.clone(), handle);
            }
        }
        inner.builders.insert(key, builder.clone());
        Ok(builder)
    }

    fn resolve_key(&self) -> Result<String> {
        let (pattern, interpolator) = {
            let mut inner = self.write();
            let pattern = inner.pattern.clone().ok_or(BuilderError::MissingPattern)?;
            let interpolator = inner
                .interpolator
                .get_or_insert_with(|| Arc::new(Interpolator::with_defaults()))
                .clone();
            (pattern, interpolator)
        };

        // The guard marks this instance as resolving: a lookup that queries
        // this builder's own configuration during interpolation observes the
        // flag and sees an empty configuration instead of recursing
        let _guard = ResolveGuard::acquire(&self.resolving);
        interpolator
            .interpolate_lenient(&pattern)
            .map_err(|e| BuilderError::Source(e.into()))
    }
}

impl Default for MultiSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationBuilder for MultiSourceBuilder {
    fn get_configuration(&self) -> Result<Arc<ConfigTree>> {
        if self.resolving.load(Ordering::SeqCst) {
            // Re-entrant read during key resolution
            return Ok(Arc::new(ConfigTree::new()));
        }
        let allow = self.read().allow_fail_on_init;
        match self.managed_builder() {
            Ok(builder) => builder.get_configuration(),
            Err(BuilderError::MissingPattern) if allow => Ok(Arc::new(ConfigTree::new())),
            Err(err) => Err(err),
        }
    }

    /// Discard cached results of all managed builders, keeping the cache
    /// itself.
    fn reset_result(&self) {
        let inner = self.read();
        for builder in inner.builders.values() {
            builder.reset_result();
        }
    }

    /// Flush the managed-builder cache entirely.
    fn reset(&self) {
        let params = self.read().params.clone();
        self.reset_parameters(params);
    }

    fn reload_handle(&self) -> Option<Arc<dyn ReloadHandle>> {
        Some(self.aggregator.clone() as Arc<dyn ReloadHandle>)
    }
}

/// Interpolation lookup backed by a multi-source builder's own
/// configuration. Holds a weak reference so the lookup can live inside the
/// interpolator the builder owns.
pub struct MultiSourceLookup {
    target: Weak<MultiSourceBuilder>,
}

impl MultiSourceLookup {
    pub fn new(target: Weak<MultiSourceBuilder>) -> Self {
        Self { target }
    }
}

impl Lookup for MultiSourceLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        let target = self.target.upgrade()?;
        target.get_configuration().ok()?.get_string(name)
    }
}

struct ResolveGuard<'a> {
    flag: &'a AtomicBool,
    owned: bool,
}

impl<'a> ResolveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        let owned = !flag.swap(true, Ordering::SeqCst);
        Self { flag, owned }
    }
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}
