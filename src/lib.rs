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

//! Configuration-builder orchestration: declarative composition of
//! configuration sources into one merged, immutable view.
//!
//! Given a definition tree describing configuration sources, a
//! [`CombinedBuilder`] resolves each declaration's provider, cascades
//! parameter inheritance, builds the child builders, and merges their
//! results with deterministic override semantics. A [`MultiSourceBuilder`]
//! selects and caches builders by a runtime-interpolated key with cycle
//! protection, and a [`ReloadAggregator`] composes per-source reload checks
//! into one composite decision.
//!
//! ```no_run
//! use config_weaver::{CombinedBuilder, InMemorySource, ParameterSet};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), config_weaver::BuilderError> {
//! let definition = "\
//! override:
//!   - tag: file
//!     path: base.yaml
//!   - tag: file
//!     path: prod.yaml
//!     optional: true
//! ";
//! let builder = CombinedBuilder::new()
//!     .with_definition_source(Arc::new(InMemorySource::new(definition)));
//! builder.configure(ParameterSet::new().with_base_path("/etc/app"));
//!
//! use config_weaver::ConfigurationBuilder;
//! let config = builder.get_configuration()?;
//! let host = config.get_string("db.host");
//! # let _ = host;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod combined;
pub mod declaration;
pub mod error;
pub mod event;
pub mod interpolation;
pub mod multifile;
pub mod parameters;
pub mod provider;
pub mod reload;
pub mod source;
pub mod tree;

pub use builder::{ConfigurationBuilder, EmptyResultBuilder, SourceBuilder};
pub use combined::{CombinedBuilder, CombinedBuilderProvider};
pub use declaration::Declaration;
pub use error::{BuilderError, Result};
pub use event::BuilderListener;
pub use interpolation::{
    interpolate_env, EnvLookup, InterpolationError, Interpolator, Lookup, MapLookup, TreeLookup,
};
pub use multifile::{
    FileBuilderFactory, ManagedBuilderFactory, MultiSourceBuilder, MultiSourceLookup,
};
pub use parameters::{
    apply_parameters, CopyDefaultsHandler, DefaultsHandler, DefaultsRegistry, FileParams,
    ParameterKind, ParameterSet, ParameterTarget, ParameterValue,
};
pub use provider::{
    BuildContext, BuilderProvider, EnvSourceProvider, FileExtensionProvider, FileSourceProvider,
    ProviderRegistry,
};
pub use reload::{
    FileReloadDetector, ReloadAggregator, ReloadDetector, ReloadHandle, ReloadingController,
};
pub use source::{
    from_json_str, from_yaml_str, ConfigSource, EnvSource, FileSource, InMemorySource, TreeSource,
};
pub use tree::{ConfigNode, ConfigTree, NodeCombiner};
