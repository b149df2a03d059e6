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

//! Declaration normalization.
//!
//! A [`Declaration`] is a normalized, immutable view over one node of the
//! definition tree. Reserved attributes carry a `config-` prefix; for
//! backward compatibility the bare names `at` and `optional` are also
//! honored, but a prefixed attribute always wins over its bare alias when
//! both are present on the same node. Attribute values pass through an
//! interpolation hook before being returned (a no-op unless an interpolator
//! is attached).

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{BuilderError, Result};
use crate::interpolation::Interpolator;
use crate::tree::{parse_bool, value_to_string, ConfigNode};

/// Prefix marking an attribute as reserved for the orchestration layer.
pub const RESERVED_PREFIX: &str = "config-";

pub const ATTR_TAG: &str = "tag";
pub const ATTR_NAME: &str = "name";
pub const ATTR_AT: &str = "at";
pub const ATTR_OPTIONAL: &str = "optional";
pub const ATTR_FORCE_CREATE: &str = "force-create";
pub const ATTR_RELOAD: &str = "reload";
pub const ATTR_RESULT_CLASS: &str = "result-class";
pub const ATTR_PROVIDER_CLASS: &str = "provider-class";

/// Bare names whose `config-` prefixed form is reserved.
const RESERVED_BARE_NAMES: &[&str] = &[
    ATTR_NAME,
    ATTR_AT,
    ATTR_OPTIONAL,
    ATTR_FORCE_CREATE,
    ATTR_RELOAD,
    ATTR_RESULT_CLASS,
    ATTR_PROVIDER_CLASS,
];

/// Bare names honored as legacy aliases of their prefixed form.
const LEGACY_BARE_NAMES: &[&str] = &[ATTR_AT, ATTR_OPTIONAL];

fn prefixed(bare: &str) -> String {
    format!("{RESERVED_PREFIX}{bare}")
}

/// A normalized view over one node of the definition tree. Constructed
/// fresh per traversal and immutable once built.
pub struct Declaration {
    node: ConfigNode,
    interpolator: Option<Arc<Interpolator>>,
}

impl Declaration {
    pub fn new(node: ConfigNode) -> Self {
        Self {
            node,
            interpolator: None,
        }
    }

    /// Attach the interpolation hook applied to attribute values.
    pub fn with_interpolator(mut self, interpolator: Arc<Interpolator>) -> Self {
        self.interpolator = Some(interpolator);
        self
    }

    pub fn node(&self) -> &ConfigNode {
        &self.node
    }

    /// The declaration's provider tag.
    pub fn tag(&self) -> Option<String> {
        self.attribute(ATTR_TAG)
    }

    /// Raw attribute lookup: the node's attribute map first, then a scalar
    /// child of the same name (the shape produced by parsed YAML/JSON
    /// definitions).
    fn raw_attribute(&self, name: &str) -> Option<String> {
        if let Some(value) = self.node.attribute(name) {
            return Some(value.to_string());
        }
        self.node
            .children_named(name)
            .find(|c| c.is_leaf())
            .and_then(|c| c.value().map(value_to_string))
    }

    fn has_attribute(&self, name: &str) -> bool {
        self.raw_attribute(name).is_some()
    }

    /// An attribute value after the interpolation hook.
    pub fn attribute(&self, name: &str) -> Option<String> {
        let raw = self.raw_attribute(name)?;
        Some(match &self.interpolator {
            Some(interpolator) => interpolator.interpolate_lenient(&raw).unwrap_or(raw),
            None => raw,
        })
    }

    /// A reserved attribute with the prefixed form taking precedence over
    /// the bare legacy alias.
    fn resolved(&self, bare: &str) -> Option<String> {
        self.attribute(&prefixed(bare))
            .or_else(|| self.attribute(bare))
    }

    /// True for names in the fixed reserved set, and for the bare legacy
    /// names `at` and `optional` when no prefixed counterpart exists on the
    /// same node.
    pub fn is_reserved_attribute_name(&self, name: &str) -> bool {
        if name == ATTR_TAG {
            return true;
        }
        if let Some(bare) = name.strip_prefix(RESERVED_PREFIX) {
            return RESERVED_BARE_NAMES.contains(&bare);
        }
        LEGACY_BARE_NAMES.contains(&name) && !self.has_attribute(&prefixed(name))
    }

    pub fn name(&self) -> Option<String> {
        self.attribute(&prefixed(ATTR_NAME))
    }

    /// The dotted prefix the child configuration is mounted under, if any.
    pub fn at(&self) -> Option<String> {
        self.resolved(ATTR_AT)
    }

    pub fn is_optional(&self) -> Result<bool> {
        self.bool_attribute(ATTR_OPTIONAL)
    }

    pub fn is_force_create(&self) -> Result<bool> {
        self.prefixed_bool_attribute(ATTR_FORCE_CREATE)
    }

    pub fn is_reload(&self) -> Result<bool> {
        self.prefixed_bool_attribute(ATTR_RELOAD)
    }

    pub fn result_class(&self) -> Option<String> {
        self.attribute(&prefixed(ATTR_RESULT_CLASS))
    }

    /// Name of a custom provider registered on the registry, overriding tag
    /// dispatch.
    pub fn provider_name(&self) -> Option<String> {
        self.attribute(&prefixed(ATTR_PROVIDER_CLASS))
    }

    fn bool_attribute(&self, bare: &str) -> Result<bool> {
        match self.resolved(bare) {
            None => Ok(false),
            Some(value) => parse_bool(&value).ok_or(BuilderError::MalformedDeclaration {
                attribute: bare.to_string(),
                value,
            }),
        }
    }

    fn prefixed_bool_attribute(&self, bare: &str) -> Result<bool> {
        match self.attribute(&prefixed(bare)) {
            None => Ok(false),
            Some(value) => parse_bool(&value).ok_or(BuilderError::MalformedDeclaration {
                attribute: bare.to_string(),
                value,
            }),
        }
    }

    /// All non-reserved scalar attributes, interpolated, in document order.
    /// These become builder parameters for the child.
    pub fn builder_attributes(&self) -> IndexMap<String, String> {
        let mut out = IndexMap::new();
        for (name, _) in self.node.attributes() {
            if !self.is_reserved_attribute_name(name) {
                if let Some(value) = self.attribute(name) {
                    out.insert(name.clone(), value);
                }
            }
        }
        for child in self.node.children() {
            if child.is_leaf()
                && !self.is_reserved_attribute_name(child.name())
                && !out.contains_key(child.name())
            {
                if let Some(value) = self.attribute(child.name()) {
                    out.insert(child.name().to_string(), value);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node_with(pairs: &[(&str, &str)]) -> ConfigNode {
        let mut node = ConfigNode::new("override");
        for (k, v) in pairs {
            node.add_child(ConfigNode::leaf(*k, *v));
        }
        node
    }

    #[test]
    fn test_prefixed_attribute_wins_over_bare_alias() {
        let decl = Declaration::new(node_with(&[
            ("config-optional", "false"),
            ("optional", "true"),
        ]));
        assert!(!decl.is_optional().expect("parses"));

        let decl = Declaration::new(node_with(&[("config-at", "db"), ("at", "legacy")]));
        assert_eq!(decl.at(), Some("db".to_string()));
    }

    #[test]
    fn test_bare_alias_honored_when_prefixed_absent() {
        let decl = Declaration::new(node_with(&[("optional", "true"), ("at", "db")]));
        assert!(decl.is_optional().expect("parses"));
        assert_eq!(decl.at(), Some("db".to_string()));
    }

    #[test]
    fn test_bare_name_not_reserved_when_prefixed_present() {
        let decl = Declaration::new(node_with(&[
            ("config-optional", "true"),
            ("optional", "anything"),
        ]));
        assert!(decl.is_reserved_attribute_name("config-optional"));
        assert!(!decl.is_reserved_attribute_name("optional"));

        // Without the prefixed form the bare name is reserved again
        let decl = Declaration::new(node_with(&[("optional", "true")]));
        assert!(decl.is_reserved_attribute_name("optional"));
    }

    #[test]
    fn test_malformed_boolean_raised_on_read() {
        let decl = Declaration::new(node_with(&[("optional", "maybe")]));
        let err = decl.is_optional().expect_err("malformed boolean");
        assert!(matches!(err, BuilderError::MalformedDeclaration { .. }));
    }

    #[test]
    fn test_missing_flags_default_false() {
        let decl = Declaration::new(node_with(&[("tag", "file")]));
        assert!(!decl.is_optional().expect("default"));
        assert!(!decl.is_force_create().expect("default"));
        assert!(!decl.is_reload().expect("default"));
    }

    #[test]
    fn test_builder_attributes_exclude_reserved() {
        let decl = Declaration::new(node_with(&[
            ("tag", "file"),
            ("config-name", "base"),
            ("optional", "true"),
            ("path", "base.yaml"),
            ("prefix", "APP"),
        ]));
        let attrs = decl.builder_attributes();

        assert_eq!(attrs.get("path"), Some(&"base.yaml".to_string()));
        assert_eq!(attrs.get("prefix"), Some(&"APP".to_string()));
        assert!(!attrs.contains_key("tag"));
        assert!(!attrs.contains_key("config-name"));
        assert!(!attrs.contains_key("optional"));
    }

    #[test]
    fn test_non_reserved_bare_alias_leaks_into_builder_attributes() {
        // With config-optional present, bare "optional" is a plain attribute
        let decl = Declaration::new(node_with(&[
            ("config-optional", "true"),
            ("optional", "custom-value"),
        ]));
        let attrs = decl.builder_attributes();
        assert_eq!(attrs.get("optional"), Some(&"custom-value".to_string()));
    }

    #[test]
    fn test_attribute_values_pass_interpolation_hook() {
        std::env::set_var("CW_DECL_PATH", "interp.yaml");
        let decl = Declaration::new(node_with(&[("path", "${CW_DECL_PATH}")]))
            .with_interpolator(Arc::new(Interpolator::with_defaults()));
        assert_eq!(decl.attribute("path"), Some("interp.yaml".to_string()));
    }

    #[test]
    fn test_tag_and_provider_name() {
        let decl = Declaration::new(node_with(&[
            ("tag", "file"),
            ("config-provider-class", "my-provider"),
        ]));
        assert_eq!(decl.tag(), Some("file".to_string()));
        assert_eq!(decl.provider_name(), Some("my-provider".to_string()));
    }
}
