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

//! Combined-builder composition.
//!
//! A [`CombinedBuilder`] interprets a definition tree: it walks the
//! `override` and `additional` declarations in document order, resolves each
//! tag's provider, cascades parameter inheritance, builds (and caches) the
//! child builders, and merges their results into one combined configuration.
//! `override` declarations merge with override semantics (registered list
//! keys union instead), `additional` declarations union into the base. The
//! published result is a fully materialized `Arc<ConfigTree>`.
//!
//! Definition tree conventions: each child of the root named `override` or
//! `additional` is one declaration; a root child named `list-key` registers
//! its value as a list-type key.

use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::builder::{ConfigurationBuilder, EmptyResultBuilder, SourceBuilder};
use crate::declaration::Declaration;
use crate::error::{BuilderError, Result};
use crate::event::BuilderListener;
use crate::interpolation::Interpolator;
use crate::parameters::{DefaultsRegistry, ParameterSet, ParameterValue};
use crate::provider::{BuildContext, BuilderProvider, ProviderRegistry};
use crate::reload::{ReloadAggregator, ReloadHandle};
use crate::source::{ConfigSource, TreeSource};
use crate::tree::{value_to_string, ConfigNode, ConfigTree, NodeCombiner};

const SECTION_OVERRIDE: &str = "override";
const SECTION_ADDITIONAL: &str = "additional";
const SECTION_LIST_KEY: &str = "list-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unconfigured,
    Configured,
    ResultBuilt,
}

struct Inner {
    phase: Phase,
    definition: Option<Arc<dyn ConfigurationBuilder>>,
    params: ParameterSet,
    registry: ProviderRegistry,
    defaults: DefaultsRegistry,
    list_keys: HashSet<String>,
    interpolator: Arc<Interpolator>,
    children: IndexMap<String, Arc<dyn ConfigurationBuilder>>,
    result: Option<Arc<ConfigTree>>,
}

/// Orchestrates child builders over a definition tree and merges their
/// results. Mutating operations require external serialization; the
/// published result is immutable and safe for unsynchronized concurrent
/// reads.
pub struct CombinedBuilder {
    inner: RwLock<Inner>,
    aggregator: Arc<ReloadAggregator>,
}

impl CombinedBuilder {
    pub fn new() -> Self {
        let mut registry = ProviderRegistry::standard();
        // Registered as inherited so callers may override the tag
        let nested: IndexMap<String, Arc<dyn BuilderProvider>> =
            [(
                "combined".to_string(),
                Arc::new(CombinedBuilderProvider) as Arc<dyn BuilderProvider>,
            )]
            .into_iter()
            .collect();
        // A fresh registry cannot be read-only
        let _ = registry.register_missing_from_map(&nested);

        Self {
            inner: RwLock::new(Inner {
                phase: Phase::Unconfigured,
                definition: None,
                params: ParameterSet::new(),
                registry,
                defaults: DefaultsRegistry::new(),
                list_keys: HashSet::new(),
                interpolator: Arc::new(Interpolator::with_defaults()),
                children: IndexMap::new(),
                result: None,
            }),
            aggregator: Arc::new(ReloadAggregator::new()),
        }
    }

    pub fn with_definition_builder(self, builder: Arc<dyn ConfigurationBuilder>) -> Self {
        self.write().definition = Some(builder);
        self
    }

    /// Wrap a raw definition source in a plain builder.
    pub fn with_definition_source(self, source: Arc<dyn ConfigSource>) -> Self {
        self.with_definition_builder(Arc::new(SourceBuilder::new(source)))
    }

    /// Mark a dotted key as list-type: merged by concatenation in source
    /// order instead of override.
    pub fn with_list_key(self, key: impl Into<String>) -> Self {
        self.write().list_keys.insert(key.into());
        self
    }

    pub fn with_defaults(self, defaults: DefaultsRegistry) -> Self {
        self.write().defaults = defaults;
        self
    }

    pub fn with_interpolator(self, interpolator: Arc<Interpolator>) -> Self {
        self.write().interpolator = interpolator;
        self
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a provider for a declaration tag.
    pub fn register_provider(
        &self,
        tag: impl Into<String>,
        provider: Arc<dyn BuilderProvider>,
    ) -> Result<()> {
        self.write().registry.register(tag, provider)
    }

    /// Register a custom provider addressed by `config-provider-class`.
    pub fn register_custom_provider(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn BuilderProvider>,
    ) -> Result<()> {
        self.write().registry.register_custom(name, provider)
    }

    /// Inherit a parent registry's entries for tags not registered here.
    pub fn register_missing_providers(&self, source: &ProviderRegistry) -> Result<()> {
        self.write().registry.register_missing_providers(source)
    }

    /// A read-only view of the current provider registry.
    pub fn registry_snapshot(&self) -> ProviderRegistry {
        self.read().registry.snapshot()
    }

    /// Apply the builder parameters and move into the configured state.
    /// Fluent: returns the same instance.
    pub fn configure(&self, params: ParameterSet) -> &Self {
        let mut inner = self.write();
        inner.params = params;
        inner.result = None;
        inner.phase = Phase::Configured;
        self
    }

    /// The cached child builder registered under the given name.
    pub fn named_builder(&self, name: &str) -> Option<Arc<dyn ConfigurationBuilder>> {
        self.read().children.get(name).cloned()
    }

    pub fn reload_aggregator(&self) -> Arc<ReloadAggregator> {
        self.aggregator.clone()
    }

    fn build(&self) -> Result<Arc<ConfigTree>> {
        let mut inner = self.write();
        match inner.phase {
            Phase::Unconfigured => {
                return Err(BuilderError::UnsupportedOperation(
                    "combined builder has not been configured".to_string(),
                ));
            }
            Phase::ResultBuilt => {
                let stale = self.aggregator.check_for_reloading();
                if !stale {
                    if let Some(result) = &inner.result {
                        return Ok(result.clone());
                    }
                }
                if stale {
                    debug!("a child source changed, re-merging combined result");
                }
                inner.result = None;
            }
            Phase::Configured => {}
        }

        // Definition resolution failures are always fatal
        let definition = inner
            .definition
            .clone()
            .ok_or(BuilderError::MissingDefinitionBuilder)?;
        let def_tree = definition.get_configuration()?;

        let mut list_keys = inner.list_keys.clone();
        for node in def_tree.root().children_named(SECTION_LIST_KEY) {
            if let Some(value) = node.value() {
                list_keys.insert(value_to_string(value));
            }
        }

        let declarations: Vec<(ConfigNode, bool)> = def_tree
            .root()
            .children_named(SECTION_OVERRIDE)
            .map(|n| (n.clone(), false))
            .chain(
                def_tree
                    .root()
                    .children_named(SECTION_ADDITIONAL)
                    .map(|n| (n.clone(), true)),
            )
            .collect();

        let registry = inner.registry.clone();
        let parent_params = inner.params.clone();
        let defaults = inner.defaults.clone();
        let interpolator = inner.interpolator.clone();

        let mut combined = ConfigTree::new();
        let empty_keys = HashSet::new();

        for (index, (node, additional)) in declarations.into_iter().enumerate() {
            let decl = Declaration::new(node).with_interpolator(interpolator.clone());
            let name = decl
                .name()
                .unwrap_or_else(|| format!("builder{index}"));
            let optional = decl.is_optional()?;
            let force_create = decl.is_force_create()?;

            let builder = match inner.children.get(&name) {
                Some(builder) => Ok(builder.clone()),
                None => build_child(&registry, &parent_params, &defaults, &decl),
            };

            let child_tree = match builder {
                Ok(builder) => {
                    let built = builder.get_configuration();
                    if built.is_ok() && !inner.children.contains_key(&name) {
                        if decl.is_reload()? {
                            if let Some(handle) = builder.reload_handle() {
                                self.aggregator.add_handle(name.clone(), handle);
                            }
                        }
                        inner.children.insert(name.clone(), builder);
                    }
                    built
                }
                Err(err) => Err(err),
            };

            let child_tree = match child_tree {
                Ok(tree) => tree,
                Err(err) => {
                    if optional && force_create {
                        warn!("optional child '{name}' failed, registering empty result: {err}");
                        inner
                            .children
                            .insert(name.clone(), Arc::new(EmptyResultBuilder::new()));
                        Arc::new(ConfigTree::new())
                    } else if optional {
                        warn!("skipping optional child '{name}': {err}");
                        continue;
                    } else {
                        return Err(BuilderError::ChildBuildFailed {
                            name,
                            source: Box::new(err),
                        });
                    }
                }
            };

            let mounted = match decl.at() {
                Some(prefix) => child_tree.mounted_at(&prefix),
                None => (*child_tree).clone(),
            };
            if additional {
                combined.merge_from(&mounted, NodeCombiner::Union, &empty_keys);
            } else {
                combined.merge_from(&mounted, NodeCombiner::Override, &list_keys);
            }
        }

        let result = Arc::new(combined);
        inner.result = Some(result.clone());
        inner.phase = Phase::ResultBuilt;
        self.aggregator.reset_reloading_state();
        for listener in inner.params.listeners() {
            listener.on_result_created();
        }
        info!(
            "combined configuration built from {} child builders",
            inner.children.len()
        );
        Ok(result)
    }
}

impl Default for CombinedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a declaration's provider, cascade parameters, and create the
/// child builder.
fn build_child(
    registry: &ProviderRegistry,
    parent: &ParameterSet,
    defaults: &DefaultsRegistry,
    decl: &Declaration,
) -> Result<Arc<dyn ConfigurationBuilder>> {
    let tag = decl.tag().ok_or_else(|| {
        BuilderError::InvalidArgument("declaration has no tag".to_string())
    })?;
    let provider = match decl.provider_name() {
        Some(name) => registry
            .custom_provider(&name)
            .ok_or(BuilderError::ProviderNotFound { tag: name })?,
        None => registry
            .resolve(&tag)
            .ok_or(BuilderError::ProviderNotFound { tag: tag.clone() })?,
    };

    // Cascade: inherited parent settings, then per-kind defaults, then the
    // declaration's own attributes
    let mut params = ParameterSet::for_kind(provider.param_kind());
    params.inherit_from_set(parent);
    defaults.initialize(&mut params)?;
    for (attr, value) in decl.builder_attributes() {
        let typed = ParameterValue::Str(value.clone());
        if !crate::parameters::ParameterTarget::set_parameter(&mut params, &attr, &typed) {
            params.set_extra(attr, value);
        }
    }
    if params.encoding().is_none() {
        if let Some(encoding) = registry.default_encoding(params.kind()) {
            let encoding = encoding.to_string();
            params = params.with_encoding(encoding);
        }
    }

    let ctx = BuildContext {
        declaration: decl,
        params: &params,
        registry,
    };
    if decl.is_reload()? {
        if !provider.supports_reloading() {
            return Err(BuilderError::ReloadingUnsupported { tag });
        }
        provider.create_reloading_builder(&ctx)
    } else {
        provider.create_builder(&ctx)
    }
}

impl ConfigurationBuilder for CombinedBuilder {
    fn get_configuration(&self) -> Result<Arc<ConfigTree>> {
        self.build()
    }

    /// Discard the merged result but keep the child-builder cache; the next
    /// access re-merges using possibly-changed child results.
    fn reset_result(&self) {
        let mut inner = self.write();
        inner.result = None;
        if inner.phase == Phase::ResultBuilt {
            inner.phase = Phase::Configured;
        }
        for listener in inner.params.listeners() {
            listener.on_reset();
        }
    }

    /// Discard the result and the child-builder cache, detaching listeners
    /// on cached children and deregistering their reload handles.
    fn reset(&self) {
        {
            let mut inner = self.write();
            inner.result = None;
            if inner.phase == Phase::ResultBuilt {
                inner.phase = Phase::Configured;
            }
            for builder in inner.children.values() {
                builder.reset_result();
            }
            inner.children.clear();
        }
        self.aggregator.clear();
        let inner = self.read();
        for listener in inner.params.listeners() {
            listener.on_reset();
        }
    }

    fn reload_handle(&self) -> Option<Arc<dyn ReloadHandle>> {
        Some(self.aggregator.clone() as Arc<dyn ReloadHandle>)
    }
}

/// Provider for nested combined configurations (`tag: combined`). The
/// declaration's own `override`/`additional`/`list-key` children form the
/// nested definition tree; the parent's registry entries are inherited for
/// tags the nested builder has not bound itself.
pub struct CombinedBuilderProvider;

impl BuilderProvider for CombinedBuilderProvider {
    fn create_builder(&self, ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
        let mut root = ConfigNode::new("");
        for child in ctx.declaration.node().children() {
            if matches!(
                child.name(),
                SECTION_OVERRIDE | SECTION_ADDITIONAL | SECTION_LIST_KEY
            ) {
                root.add_child(child.clone());
            }
        }
        let definition = ConfigTree::from_root(root);

        let builder = CombinedBuilder::new()
            .with_definition_source(Arc::new(TreeSource::new(definition)));
        builder.register_missing_providers(ctx.registry)?;
        builder.configure(ctx.params.clone());
        Ok(Arc::new(builder))
    }

    fn supports_reloading(&self) -> bool {
        true
    }

    /// A nested combined builder aggregates its children's controllers, so
    /// the plain variant is already reload-capable.
    fn create_reloading_builder(
        &self,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn ConfigurationBuilder>> {
        self.create_builder(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;
    use pretty_assertions::assert_eq;

    /// Test provider serving a fixed tree per tag.
    struct TreeProvider {
        tree: ConfigTree,
    }

    impl TreeProvider {
        fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
            let mut tree = ConfigTree::new();
            for (k, v) in pairs {
                tree.set_string(k, *v);
            }
            Arc::new(Self { tree })
        }
    }

    impl BuilderProvider for TreeProvider {
        fn create_builder(&self, _ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
            Ok(Arc::new(SourceBuilder::new(Arc::new(TreeSource::new(
                self.tree.clone(),
            )))))
        }
    }

    struct FailingProvider;

    impl BuilderProvider for FailingProvider {
        fn create_builder(&self, _ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
            struct Broken;
            impl ConfigSource for Broken {
                fn load(&self) -> anyhow::Result<ConfigTree> {
                    anyhow::bail!("broken source")
                }
            }
            Ok(Arc::new(SourceBuilder::new(Arc::new(Broken))))
        }
    }

    fn builder_with_definition(yaml: &str) -> CombinedBuilder {
        CombinedBuilder::new().with_definition_source(Arc::new(InMemorySource::new(yaml)))
    }

    #[test]
    fn test_unconfigured_builder_rejects_access() {
        let builder = builder_with_definition("override:\n  - tag: file\n");
        let err = builder.get_configuration().expect_err("not configured");
        assert!(matches!(err, BuilderError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_missing_definition_builder() {
        let builder = CombinedBuilder::new();
        builder.configure(ParameterSet::new());
        let err = builder.get_configuration().expect_err("no definition");
        assert!(matches!(err, BuilderError::MissingDefinitionBuilder));
    }

    #[test]
    fn test_later_overrides_win_for_scalars() {
        let builder = builder_with_definition(
            "override:\n  - tag: base\n  - tag: prod\n",
        );
        builder
            .register_provider("base", TreeProvider::new(&[("db.host", "one"), ("db.port", "1")]))
            .expect("register");
        builder
            .register_provider("prod", TreeProvider::new(&[("db.host", "two")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert_eq!(result.get_string("db.host"), Some("two".to_string()));
        assert_eq!(result.get_string("db.port"), Some("1".to_string()));
    }

    #[test]
    fn test_additional_section_unions_into_base() {
        let builder = builder_with_definition(
            "override:\n  - tag: base\nadditional:\n  - tag: extra\n",
        );
        builder
            .register_provider("base", TreeProvider::new(&[("key", "first")]))
            .expect("register");
        builder
            .register_provider("extra", TreeProvider::new(&[("key", "second")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert_eq!(result.get_list("key").len(), 2);
    }

    #[test]
    fn test_at_prefix_mounts_child() {
        let builder = builder_with_definition(
            "override:\n  - tag: creds\n    at: db.credentials\n",
        );
        builder
            .register_provider("creds", TreeProvider::new(&[("user", "admin")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert_eq!(
            result.get_string("db.credentials.user"),
            Some("admin".to_string())
        );
    }

    #[test]
    fn test_unknown_tag_is_fatal_for_required_child() {
        let builder = builder_with_definition("override:\n  - tag: nowhere\n");
        builder.configure(ParameterSet::new());

        let err = builder.get_configuration().expect_err("unknown tag");
        match err {
            BuilderError::ChildBuildFailed { source, .. } => {
                assert!(matches!(*source, BuilderError::ProviderNotFound { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_optional_child_is_skipped_on_failure() {
        let builder = builder_with_definition(
            "override:\n  - tag: nowhere\n    optional: true\n  - tag: base\n",
        );
        builder
            .register_provider("base", TreeProvider::new(&[("key", "v")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert_eq!(result.get_string("key"), Some("v".to_string()));
    }

    #[test]
    fn test_optional_force_created_child_registers_empty_result() {
        let builder = builder_with_definition(
            "override:\n  - tag: broken\n    config-name: shaky\n    optional: true\n    config-force-create: true\n",
        );
        builder
            .register_provider("broken", Arc::new(FailingProvider))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert!(result.is_empty());

        let shaky = builder.named_builder("shaky").expect("registered");
        assert!(shaky
            .get_configuration()
            .expect("empty result")
            .is_empty());
    }

    #[test]
    fn test_named_builder_lookup_and_reset_semantics() {
        let builder = builder_with_definition(
            "override:\n  - tag: base\n    config-name: base\n",
        );
        builder
            .register_provider("base", TreeProvider::new(&[("key", "v")]))
            .expect("register");
        builder.configure(ParameterSet::new());
        builder.get_configuration().expect("build succeeds");

        let cached = builder.named_builder("base").expect("cached child");

        // reset_result keeps the child cache
        builder.reset_result();
        let still_cached = builder.named_builder("base").expect("still cached");
        assert!(Arc::ptr_eq(&cached, &still_cached));

        // reset discards it
        builder.reset();
        assert!(builder.named_builder("base").is_none());
    }

    #[test]
    fn test_list_keys_from_definition_tree() {
        let builder = builder_with_definition(
            "list-key: tables.table\noverride:\n  - tag: one\n  - tag: two\n",
        );
        let mut first = ConfigTree::new();
        first.set_string("tables.table.name", "users");
        let mut second = ConfigTree::new();
        second.set_string("tables.table.name", "orders");
        builder
            .register_provider("one", Arc::new(TreeProvider { tree: first }))
            .expect("register");
        builder
            .register_provider("two", Arc::new(TreeProvider { tree: second }))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert_eq!(result.get_list("tables.table.name").len(), 2);
    }

    #[test]
    fn test_nested_combined_declaration() {
        let builder = builder_with_definition(
            "override:\n  - tag: combined\n    config-name: nested\n    override:\n      - tag: leaf\n",
        );
        builder
            .register_provider("leaf", TreeProvider::new(&[("inner.key", "v")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let result = builder.get_configuration().expect("build succeeds");
        assert_eq!(result.get_string("inner.key"), Some("v".to_string()));
        assert!(builder.named_builder("nested").is_some());
    }

    #[test]
    fn test_reload_on_non_reloading_provider_fails() {
        let builder = builder_with_definition(
            "override:\n  - tag: plain\n    config-reload: true\n",
        );
        builder
            .register_provider("plain", TreeProvider::new(&[("key", "v")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let err = builder.get_configuration().expect_err("reload unsupported");
        match err {
            BuilderError::ChildBuildFailed { source, .. } => {
                assert!(matches!(*source, BuilderError::ReloadingUnsupported { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_result_is_cached_across_accesses() {
        let builder = builder_with_definition("override:\n  - tag: base\n");
        builder
            .register_provider("base", TreeProvider::new(&[("key", "v")]))
            .expect("register");
        builder.configure(ParameterSet::new());

        let first = builder.get_configuration().expect("build succeeds");
        let second = builder.get_configuration().expect("build succeeds");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
