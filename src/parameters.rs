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

//! Builder parameter sets, the inheritance cascade, and per-kind defaults.
//!
//! A [`ParameterSet`] is a typed, mergeable bag of builder settings.
//! Inheritance copies a parent's exported settings into a child, but only
//! for settings the child has not explicitly set. Cloning is structural:
//! nested parameter objects are deep-copied, never shared, so a child can
//! never mutate a value still visible to its parent or siblings.
//!
//! Settings are applied to consumers through an explicit visitor
//! ([`ParameterTarget`]) rather than reflection: for a named setting, each
//! candidate target is offered the value in priority order and the first one
//! that recognizes it consumes it; unrecognized names are ignored.

use indexmap::IndexMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BuilderError;
use crate::event::BuilderListener;

/// Exported-map keys for the recognized settings.
pub const KEY_BASE_PATH: &str = "basePath";
pub const KEY_LIST_DELIMITER: &str = "listDelimiter";
pub const KEY_THROW_ON_MISSING: &str = "throwOnMissing";
pub const KEY_RELOAD_REFRESH_DELAY: &str = "reloadRefreshDelay";
pub const KEY_FILE_PATH: &str = "filePath";
pub const KEY_FILE_ENCODING: &str = "fileEncoding";

/// A single exported setting value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Duration(Duration),
}

impl ParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// String rendering used when a setting crosses a typed boundary, e.g.
    /// a declaration attribute applied onto a parameter set.
    pub fn to_display_string(&self) -> String {
        match self {
            ParameterValue::Str(s) => s.clone(),
            ParameterValue::Bool(b) => b.to_string(),
            ParameterValue::Int(i) => i.to_string(),
            ParameterValue::Duration(d) => d.as_millis().to_string(),
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            ParameterValue::Str(s) => crate::tree::parse_bool(s),
            _ => None,
        }
    }

    fn as_duration(&self) -> Option<Duration> {
        match self {
            ParameterValue::Duration(d) => Some(*d),
            ParameterValue::Int(ms) if *ms >= 0 => Some(Duration::from_millis(*ms as u64)),
            ParameterValue::Str(s) => s.parse::<u64>().ok().map(Duration::from_millis),
            _ => None,
        }
    }
}

/// The place of a parameter set in the parameter-class hierarchy, used by
/// the per-kind defaults registry. `Basic` is the ancestor of every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterKind {
    #[default]
    Basic,
    File,
    MultiFile,
}

impl ParameterKind {
    /// True when values of this kind may be treated as the ancestor kind.
    pub fn is_assignable_to(self, ancestor: ParameterKind) -> bool {
        match ancestor {
            ParameterKind::Basic => true,
            ParameterKind::File => matches!(self, ParameterKind::File | ParameterKind::MultiFile),
            ParameterKind::MultiFile => self == ParameterKind::MultiFile,
        }
    }

    pub(crate) fn depth(self) -> u8 {
        match self {
            ParameterKind::Basic => 0,
            ParameterKind::File => 1,
            ParameterKind::MultiFile => 2,
        }
    }
}

/// File-related settings, held as a nested parameter object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileParams {
    pub path: Option<PathBuf>,
    pub encoding: Option<String>,
}

/// A consumer of named settings. The explicit replacement for reflective
/// property setting: returns `true` when the setting was recognized and
/// applied, `false` to let the next candidate try.
pub trait ParameterTarget {
    fn set_parameter(&mut self, name: &str, value: &ParameterValue) -> bool;
}

/// Offer each setting in the map to the targets in priority order; the
/// first target recognizing a setting consumes it. Settings no target
/// recognizes are ignored.
pub fn apply_parameters(
    map: &IndexMap<String, ParameterValue>,
    targets: &mut [&mut dyn ParameterTarget],
) {
    for (name, value) in map {
        for target in targets.iter_mut() {
            if target.set_parameter(name, value) {
                break;
            }
        }
    }
}

/// A typed, mergeable bag of builder settings.
#[derive(Clone, Default)]
pub struct ParameterSet {
    kind: ParameterKind,
    base_path: Option<String>,
    list_delimiter: Option<char>,
    throw_on_missing: Option<bool>,
    reload_refresh_delay: Option<Duration>,
    file: Option<Box<FileParams>>,
    listeners: Vec<Arc<dyn BuilderListener>>,
    extras: IndexMap<String, String>,
}

impl fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSet")
            .field("kind", &self.kind)
            .field("base_path", &self.base_path)
            .field("list_delimiter", &self.list_delimiter)
            .field("throw_on_missing", &self.throw_on_missing)
            .field("reload_refresh_delay", &self.reload_refresh_delay)
            .field("file", &self.file)
            .field("listeners", &self.listeners.len())
            .field("extras", &self.extras)
            .finish()
    }
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_kind(kind: ParameterKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_list_delimiter(mut self, delimiter: char) -> Self {
        self.list_delimiter = Some(delimiter);
        self
    }

    pub fn with_throw_on_missing(mut self, throw: bool) -> Self {
        self.throw_on_missing = Some(throw);
        self
    }

    pub fn with_reload_refresh_delay(mut self, delay: Duration) -> Self {
        self.reload_refresh_delay = Some(delay);
        self
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_mut().path = Some(path.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.file_mut().encoding = Some(encoding.into());
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn BuilderListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(name.into(), value.into());
        self
    }

    pub fn set_base_path(&mut self, base_path: impl Into<String>) {
        self.base_path = Some(base_path.into());
    }

    pub fn set_file_path(&mut self, path: impl Into<PathBuf>) {
        self.file_mut().path = Some(path.into());
    }

    pub fn set_extra(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extras.insert(name.into(), value.into());
    }

    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    pub fn list_delimiter(&self) -> Option<char> {
        self.list_delimiter
    }

    /// Whether missing-key access should fail. Defaults to `false`.
    pub fn throw_on_missing(&self) -> bool {
        self.throw_on_missing.unwrap_or(false)
    }

    pub fn reload_refresh_delay(&self) -> Option<Duration> {
        self.reload_refresh_delay
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().and_then(|f| f.path.as_deref())
    }

    pub fn encoding(&self) -> Option<&str> {
        self.file.as_ref().and_then(|f| f.encoding.as_deref())
    }

    pub fn listeners(&self) -> &[Arc<dyn BuilderListener>] {
        &self.listeners
    }

    pub fn extra(&self, name: &str) -> Option<&str> {
        self.extras.get(name).map(String::as_str)
    }

    pub fn extras(&self) -> &IndexMap<String, String> {
        &self.extras
    }

    /// The file path resolved against the base path, when both are set and
    /// the path is relative.
    pub fn resolved_file_path(&self) -> Option<PathBuf> {
        let path = self.file_path()?;
        match (path.is_relative(), self.base_path()) {
            (true, Some(base)) => Some(Path::new(base).join(path)),
            _ => Some(path.to_path_buf()),
        }
    }

    fn file_mut(&mut self) -> &mut FileParams {
        self.file.get_or_insert_with(Box::default)
    }

    /// A flattened view of all locally set and inherited settings, used for
    /// downstream propagation and for applying onto builder instances.
    pub fn exported_map(&self) -> IndexMap<String, ParameterValue> {
        let mut map = IndexMap::new();
        if let Some(base_path) = &self.base_path {
            map.insert(
                KEY_BASE_PATH.to_string(),
                ParameterValue::Str(base_path.clone()),
            );
        }
        if let Some(delimiter) = self.list_delimiter {
            map.insert(
                KEY_LIST_DELIMITER.to_string(),
                ParameterValue::Str(delimiter.to_string()),
            );
        }
        if let Some(throw) = self.throw_on_missing {
            map.insert(
                KEY_THROW_ON_MISSING.to_string(),
                ParameterValue::Bool(throw),
            );
        }
        if let Some(delay) = self.reload_refresh_delay {
            map.insert(
                KEY_RELOAD_REFRESH_DELAY.to_string(),
                ParameterValue::Duration(delay),
            );
        }
        if let Some(file) = &self.file {
            if let Some(path) = &file.path {
                map.insert(
                    KEY_FILE_PATH.to_string(),
                    ParameterValue::Str(path.display().to_string()),
                );
            }
            if let Some(encoding) = &file.encoding {
                map.insert(
                    KEY_FILE_ENCODING.to_string(),
                    ParameterValue::Str(encoding.clone()),
                );
            }
        }
        for (name, value) in &self.extras {
            map.insert(name.clone(), ParameterValue::Str(value.clone()));
        }
        map
    }

    /// Copy recognized settings from a parent's exported map, but only for
    /// settings this set has not explicitly set.
    pub fn inherit_from(&mut self, parent: &IndexMap<String, ParameterValue>) {
        for (name, value) in parent {
            match name.as_str() {
                KEY_BASE_PATH => {
                    if self.base_path.is_none() {
                        if let Some(s) = value.as_str() {
                            self.base_path = Some(s.to_string());
                        }
                    }
                }
                KEY_LIST_DELIMITER => {
                    if self.list_delimiter.is_none() {
                        if let Some(c) = value.as_str().and_then(|s| s.chars().next()) {
                            self.list_delimiter = Some(c);
                        }
                    }
                }
                KEY_THROW_ON_MISSING => {
                    if self.throw_on_missing.is_none() {
                        self.throw_on_missing = value.as_bool();
                    }
                }
                KEY_RELOAD_REFRESH_DELAY => {
                    if self.reload_refresh_delay.is_none() {
                        self.reload_refresh_delay = value.as_duration();
                    }
                }
                KEY_FILE_PATH => {
                    if self.file_path().is_none() {
                        if let Some(s) = value.as_str() {
                            self.file_mut().path = Some(PathBuf::from(s));
                        }
                    }
                }
                KEY_FILE_ENCODING => {
                    if self.encoding().is_none() {
                        if let Some(s) = value.as_str() {
                            self.file_mut().encoding = Some(s.to_string());
                        }
                    }
                }
                other => {
                    if !self.extras.contains_key(other) {
                        self.extras
                            .insert(other.to_string(), value.to_display_string());
                    }
                }
            }
        }
    }

    /// Inherit from a parent parameter set: exported settings plus event
    /// listeners (when this set has none of its own).
    pub fn inherit_from_set(&mut self, parent: &ParameterSet) {
        self.inherit_from(&parent.exported_map());
        if self.listeners.is_empty() {
            self.listeners = parent.listeners.clone();
        }
    }
}

impl ParameterTarget for ParameterSet {
    fn set_parameter(&mut self, name: &str, value: &ParameterValue) -> bool {
        match name {
            KEY_BASE_PATH => {
                self.base_path = Some(value.to_display_string());
                true
            }
            KEY_LIST_DELIMITER => {
                if let Some(c) = value.to_display_string().chars().next() {
                    self.list_delimiter = Some(c);
                }
                true
            }
            KEY_THROW_ON_MISSING => {
                if let Some(b) = value.as_bool() {
                    self.throw_on_missing = Some(b);
                }
                true
            }
            KEY_RELOAD_REFRESH_DELAY => {
                if let Some(d) = value.as_duration() {
                    self.reload_refresh_delay = Some(d);
                }
                true
            }
            // "path" is the conventional declaration spelling
            KEY_FILE_PATH | "path" => {
                self.file_mut().path = Some(PathBuf::from(value.to_display_string()));
                true
            }
            KEY_FILE_ENCODING | "encoding" => {
                self.file_mut().encoding = Some(value.to_display_string());
                true
            }
            _ => false,
        }
    }
}

/// Copies a fixed set of property values onto a new child parameter set.
pub trait DefaultsHandler: Send + Sync {
    fn init_defaults(&self, params: &mut ParameterSet) -> anyhow::Result<()>;
}

/// A defaults handler holding literal values. Properties the destination
/// does not recognize are silently skipped.
pub struct CopyDefaultsHandler {
    values: IndexMap<String, ParameterValue>,
}

impl CopyDefaultsHandler {
    pub fn new(values: IndexMap<String, ParameterValue>) -> Self {
        Self { values }
    }
}

impl<S: Into<String>> FromIterator<(S, ParameterValue)> for CopyDefaultsHandler {
    fn from_iter<T: IntoIterator<Item = (S, ParameterValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl DefaultsHandler for CopyDefaultsHandler {
    fn init_defaults(&self, params: &mut ParameterSet) -> anyhow::Result<()> {
        for (name, value) in &self.values {
            // Unrecognized destinations skip the property
            let _ = params.set_parameter(name, value);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct DefaultsEntry {
    target: ParameterKind,
    boundary: Option<ParameterKind>,
    handler: Arc<dyn DefaultsHandler>,
}

/// Registry of per-kind defaults handlers.
///
/// Handlers are applied most-general-first, so a registration for a more
/// specific kind overrides a more general one for overlapping properties.
#[derive(Clone, Default)]
pub struct DefaultsRegistry {
    entries: Vec<DefaultsEntry>,
}

impl DefaultsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every parameter set assignable to `target`.
    pub fn register(&mut self, target: ParameterKind, handler: Arc<dyn DefaultsHandler>) {
        self.entries.push(DefaultsEntry {
            target,
            boundary: None,
            handler,
        });
    }

    /// Register a handler restricted to parameter sets also assignable to
    /// `boundary`.
    pub fn register_bounded(
        &mut self,
        target: ParameterKind,
        boundary: ParameterKind,
        handler: Arc<dyn DefaultsHandler>,
    ) {
        self.entries.push(DefaultsEntry {
            target,
            boundary: Some(boundary),
            handler,
        });
    }

    /// Apply all matching handlers to a new child parameter set,
    /// most-general-first. A handler failure on a compatible destination is
    /// wrapped as a runtime configuration error.
    pub fn initialize(&self, params: &mut ParameterSet) -> Result<(), BuilderError> {
        let mut matching: Vec<&DefaultsEntry> = self
            .entries
            .iter()
            .filter(|e| {
                params.kind().is_assignable_to(e.target)
                    && e.boundary
                        .map_or(true, |b| params.kind().is_assignable_to(b))
            })
            .collect();
        // Stable sort keeps registration order within one specificity level
        matching.sort_by_key(|e| e.target.depth());

        for entry in matching {
            entry
                .handler
                .init_defaults(params)
                .map_err(BuilderError::RuntimeConfiguration)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
