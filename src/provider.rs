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

//! Builder providers and the tag registry.
//!
//! A [`BuilderProvider`] is the factory capability behind one declaration
//! tag: declaration plus cascaded parameters in, child builder out. The
//! [`ProviderRegistry`] maps tags to providers, distinguishes explicit from
//! inherited registrations, and carries the per-kind default encoding table
//! so no process-wide statics are involved.

use indexmap::IndexMap;
use log::debug;

use std::sync::Arc;

use crate::builder::{ConfigurationBuilder, SourceBuilder};
use crate::declaration::Declaration;
use crate::error::{BuilderError, Result};
use crate::parameters::{ParameterKind, ParameterSet};
use crate::reload::{FileReloadDetector, ReloadingController, DEFAULT_REFRESH_DELAY};
use crate::source::{EnvSource, FileSource};

/// Everything a provider sees when asked to create a builder.
pub struct BuildContext<'a> {
    pub declaration: &'a Declaration,
    pub params: &'a ParameterSet,
    pub registry: &'a ProviderRegistry,
}

/// Factory capability behind one declaration tag.
pub trait BuilderProvider: Send + Sync {
    /// The parameter kind the provider's builders consume, driving per-kind
    /// defaults.
    fn param_kind(&self) -> ParameterKind {
        ParameterKind::Basic
    }

    fn create_builder(&self, ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>>;

    /// Whether a reloading-capable builder variant exists.
    fn supports_reloading(&self) -> bool {
        false
    }

    fn create_reloading_builder(
        &self,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn ConfigurationBuilder>> {
        let _ = ctx;
        Err(BuilderError::UnsupportedOperation(
            "provider has no reloading builder variant".to_string(),
        ))
    }
}

/// Provider for file-backed sources (`tag: file`). Reload-capable via a
/// modification-timestamp detector.
pub struct FileSourceProvider;

impl FileSourceProvider {
    fn resolved_path(ctx: &BuildContext) -> Result<std::path::PathBuf> {
        ctx.params.resolved_file_path().ok_or_else(|| {
            BuilderError::InvalidArgument("file declaration has no path".to_string())
        })
    }
}

impl BuilderProvider for FileSourceProvider {
    fn param_kind(&self) -> ParameterKind {
        ParameterKind::File
    }

    fn create_builder(&self, ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
        let path = Self::resolved_path(ctx)?;
        debug!("creating file builder for '{}'", path.display());
        let builder = SourceBuilder::new(Arc::new(FileSource::new(path)))
            .with_parameters(ctx.params.clone());
        Ok(Arc::new(builder))
    }

    fn supports_reloading(&self) -> bool {
        true
    }

    fn create_reloading_builder(
        &self,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn ConfigurationBuilder>> {
        let path = Self::resolved_path(ctx)?;
        let delay = ctx
            .params
            .reload_refresh_delay()
            .unwrap_or(DEFAULT_REFRESH_DELAY);
        debug!("creating reloading file builder for '{}'", path.display());
        let detector = Arc::new(FileReloadDetector::new(&path, delay));
        let controller = Arc::new(ReloadingController::new(detector));
        let builder = SourceBuilder::new(Arc::new(FileSource::new(path)))
            .with_parameters(ctx.params.clone())
            .with_controller(controller);
        Ok(Arc::new(builder))
    }
}

/// Provider for process-environment sources (`tag: env`). An optional
/// `prefix` attribute restricts and strips variable names.
pub struct EnvSourceProvider;

impl BuilderProvider for EnvSourceProvider {
    fn create_builder(&self, ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
        let source = match ctx.params.extra("prefix") {
            Some(prefix) => EnvSource::with_prefix(prefix),
            None => EnvSource::new(),
        };
        let builder = SourceBuilder::new(Arc::new(source)).with_parameters(ctx.params.clone());
        Ok(Arc::new(builder))
    }
}

/// Dispatches to a member provider by the file-name extension of the
/// declared path (case-insensitive match after the last `.`). Every miss --
/// no path, no extension, or an unknown extension -- falls back to the
/// default provider; selection never errors.
pub struct FileExtensionProvider {
    by_extension: IndexMap<String, Arc<dyn BuilderProvider>>,
    default: Arc<dyn BuilderProvider>,
}

impl FileExtensionProvider {
    pub fn new(default: Arc<dyn BuilderProvider>) -> Self {
        Self {
            by_extension: IndexMap::new(),
            default,
        }
    }

    pub fn with_extension(
        mut self,
        extension: impl Into<String>,
        provider: Arc<dyn BuilderProvider>,
    ) -> Self {
        self.by_extension
            .insert(extension.into().to_ascii_lowercase(), provider);
        self
    }

    fn select(&self, params: &ParameterSet) -> &Arc<dyn BuilderProvider> {
        let extension = params
            .file_path()
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.and_then(|e| self.by_extension.get(&e)) {
            Some(provider) => provider,
            None => &self.default,
        }
    }
}

impl BuilderProvider for FileExtensionProvider {
    fn param_kind(&self) -> ParameterKind {
        ParameterKind::File
    }

    fn create_builder(&self, ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
        self.select(ctx.params).create_builder(ctx)
    }

    fn supports_reloading(&self) -> bool {
        self.default.supports_reloading()
    }

    fn create_reloading_builder(
        &self,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn ConfigurationBuilder>> {
        self.select(ctx.params).create_reloading_builder(ctx)
    }
}

#[derive(Clone)]
struct RegistryEntry {
    provider: Arc<dyn BuilderProvider>,
    inherited: bool,
}

/// Tag-to-provider registry with explicit/inherited distinction, a custom
/// provider table for `config-provider-class` dispatch, and per-kind default
/// encodings.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: IndexMap<String, RegistryEntry>,
    custom: IndexMap<String, Arc<dyn BuilderProvider>>,
    default_encodings: Vec<(ParameterKind, String)>,
    read_only: bool,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry pre-populated with the builtin providers.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        // Builtins are inserted directly so callers can still register
        // explicit overrides for these tags
        registry.entries.insert(
            "file".to_string(),
            RegistryEntry {
                provider: Arc::new(FileSourceProvider),
                inherited: true,
            },
        );
        registry.entries.insert(
            "env".to_string(),
            RegistryEntry {
                provider: Arc::new(EnvSourceProvider),
                inherited: true,
            },
        );
        registry
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.read_only {
            Err(BuilderError::UnsupportedOperation(
                "registry snapshot is read-only".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Register a provider for a tag. Fails on an empty tag and on a tag
    /// already bound by an explicit registration; inherited entries are
    /// overwritten.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        provider: Arc<dyn BuilderProvider>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let tag = tag.into();
        if tag.is_empty() {
            return Err(BuilderError::InvalidArgument(
                "provider tag must not be empty".to_string(),
            ));
        }
        if let Some(existing) = self.entries.get(&tag) {
            if !existing.inherited {
                return Err(BuilderError::InvalidArgument(format!(
                    "tag '{tag}' is already explicitly registered"
                )));
            }
        }
        self.entries.insert(
            tag,
            RegistryEntry {
                provider,
                inherited: false,
            },
        );
        Ok(())
    }

    /// Copy entries for tags absent from this registry, marking them as
    /// inherited. Existing tags are never overwritten, so the operation is
    /// idempotent. Default encodings for kinds not yet covered are copied
    /// too.
    pub fn register_missing_providers(&mut self, source: &ProviderRegistry) -> Result<()> {
        self.ensure_mutable()?;
        for (tag, entry) in &source.entries {
            if !self.entries.contains_key(tag) {
                self.entries.insert(
                    tag.clone(),
                    RegistryEntry {
                        provider: entry.provider.clone(),
                        inherited: true,
                    },
                );
            }
        }
        for (kind, encoding) in &source.default_encodings {
            if !self.default_encodings.iter().any(|(k, _)| k == kind) {
                self.default_encodings.push((*kind, encoding.clone()));
            }
        }
        Ok(())
    }

    /// Copy providers for tags absent from this registry out of a plain map.
    /// An empty tag in the source is a malformed call.
    pub fn register_missing_from_map(
        &mut self,
        source: &IndexMap<String, Arc<dyn BuilderProvider>>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        for (tag, provider) in source {
            if tag.is_empty() {
                return Err(BuilderError::InvalidArgument(
                    "provider map contains an empty tag".to_string(),
                ));
            }
            if !self.entries.contains_key(tag) {
                self.entries.insert(
                    tag.clone(),
                    RegistryEntry {
                        provider: provider.clone(),
                        inherited: true,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn resolve(&self, tag: &str) -> Option<Arc<dyn BuilderProvider>> {
        self.entries.get(tag).map(|e| e.provider.clone())
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Register a custom provider addressed by `config-provider-class`,
    /// overriding tag dispatch for declarations naming it.
    pub fn register_custom(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn BuilderProvider>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let name = name.into();
        if name.is_empty() {
            return Err(BuilderError::InvalidArgument(
                "custom provider name must not be empty".to_string(),
            ));
        }
        self.custom.insert(name, provider);
        Ok(())
    }

    pub fn custom_provider(&self, name: &str) -> Option<Arc<dyn BuilderProvider>> {
        self.custom.get(name).cloned()
    }

    /// Set the default encoding applied to builders of the given parameter
    /// kind when no encoding was declared.
    pub fn set_default_encoding(
        &mut self,
        kind: ParameterKind,
        encoding: impl Into<String>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let encoding = encoding.into();
        match self.default_encodings.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = encoding,
            None => self.default_encodings.push((kind, encoding)),
        }
        Ok(())
    }

    /// The default encoding for a kind: the registered entry for the most
    /// specific ancestor kind wins (closest match).
    pub fn default_encoding(&self, kind: ParameterKind) -> Option<&str> {
        self.default_encodings
            .iter()
            .filter(|(k, _)| kind.is_assignable_to(*k))
            .max_by_key(|(k, _)| k.depth())
            .map(|(_, e)| e.as_str())
    }

    /// A read-only view of the current contents. Mutation attempts on the
    /// snapshot fail with `UnsupportedOperation`.
    pub fn snapshot(&self) -> ProviderRegistry {
        let mut snapshot = self.clone();
        snapshot.read_only = true;
        snapshot
    }
}
