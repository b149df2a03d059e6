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

//! Hierarchical configuration trees and the node-combination merge engine.
//!
//! [`ConfigTree`] is the data shape shared by definition sources, leaf
//! builder results, and the published combined result. Nodes are addressed
//! by dotted key paths (`tables.table.name`); repeated same-named nodes model
//! list values. A published combined tree is wrapped in `Arc` and never
//! mutated again, which is what makes unsynchronized concurrent reads safe.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;

/// One node of a configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigNode {
    name: String,
    value: Option<Value>,
    attributes: IndexMap<String, String>,
    children: Vec<ConfigNode>,
}

impl ConfigNode {
    /// Create an empty node with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// Create a leaf node carrying a scalar value.
    pub fn leaf(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut node = Self::new(name);
        node.value = Some(value.into());
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn attributes(&self) -> &IndexMap<String, String> {
        &self.attributes
    }

    pub fn children(&self) -> &[ConfigNode] {
        &self.children
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a, 'b>(
        &'a self,
        name: &'b str,
    ) -> impl Iterator<Item = &'a ConfigNode> + use<'a, 'b> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn child_named_mut(&mut self, name: &str) -> Option<&mut ConfigNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn add_child(&mut self, child: ConfigNode) {
        self.children.push(child);
    }

    /// A node is a leaf when it has a value and no children.
    pub fn is_leaf(&self) -> bool {
        self.value.is_some() && self.children.is_empty()
    }
}

/// How two trees are combined during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCombiner {
    /// Later scalar values replace earlier ones; structure is merged
    /// recursively. Keys registered as list keys are appended instead.
    Override,
    /// Nodes are appended without replacement.
    Union,
}

/// A hierarchical configuration with dotted-key addressing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: ConfigNode,
}

impl ConfigTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            root: ConfigNode::new(""),
        }
    }

    pub fn from_root(root: ConfigNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &ConfigNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut ConfigNode {
        &mut self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.value.is_none() && self.root.children.is_empty()
    }

    /// All nodes addressed by the dotted key path, in document order.
    pub fn nodes_at(&self, path: &str) -> Vec<&ConfigNode> {
        if path.is_empty() {
            return vec![&self.root];
        }
        let mut current: Vec<&ConfigNode> = vec![&self.root];
        for segment in path.split('.') {
            current = current
                .into_iter()
                .flat_map(|n| n.children_named(segment))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// First value at the key, if any.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.nodes_at(key).into_iter().find_map(|n| n.value())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_value(key).map(value_to_string)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_value(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => parse_bool(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get_value(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// All values at the key, in document order. Repeated same-named nodes
    /// model lists.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.nodes_at(key)
            .into_iter()
            .filter_map(|n| n.value().map(value_to_string))
            .collect()
    }

    /// Set a string value at the key, creating intermediate nodes as needed.
    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        let segments: Vec<&str> = key.split('.').collect();
        let node = ensure_path(&mut self.root, &segments);
        node.value = Some(Value::String(value.into()));
    }

    /// Return a copy of this tree with its contents mounted under the given
    /// dotted prefix. An empty prefix yields a plain copy.
    pub fn mounted_at(&self, prefix: &str) -> ConfigTree {
        if prefix.is_empty() {
            return self.clone();
        }
        let segments: Vec<&str> = prefix.split('.').collect();
        let mut root = ConfigNode::new("");
        root.add_child(wrap_under(&segments, &self.root));
        ConfigTree { root }
    }

    /// Merge another tree into this one.
    ///
    /// With [`NodeCombiner::Override`], later scalar values replace earlier
    /// ones and structure is merged recursively, except for keys in
    /// `list_keys`, which are appended in source order. With
    /// [`NodeCombiner::Union`], all nodes are appended.
    pub fn merge_from(
        &mut self,
        other: &ConfigTree,
        combiner: NodeCombiner,
        list_keys: &HashSet<String>,
    ) {
        merge_children(&mut self.root, &other.root, combiner, list_keys, "");
    }

    /// Split leaf string values containing the delimiter into repeated
    /// same-named nodes, so they participate in list addressing.
    pub fn split_lists(&mut self, delimiter: char) {
        split_node_lists(&mut self.root, delimiter);
    }

    /// Build a tree from a parsed JSON/YAML document. Objects become child
    /// nodes, arrays become repeated same-named nodes, scalars become leaf
    /// values.
    pub fn from_value(value: &Value) -> Self {
        let mut root = ConfigNode::new("");
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    append_from_value(&mut root, k, v);
                }
            }
            Value::Null => {}
            other => root.value = Some(other.clone()),
        }
        ConfigTree { root }
    }

    /// Render the tree back into a JSON value. Repeated same-named children
    /// fold into arrays; attributes are not rendered.
    pub fn to_value(&self) -> Value {
        node_to_value(&self.root)
    }
}

/// Render a scalar configuration value as a string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a configuration boolean. Only `true`/`false` (case-insensitive) are
/// accepted; anything else is a malformed value.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn ensure_path<'a>(node: &'a mut ConfigNode, segments: &[&str]) -> &'a mut ConfigNode {
    if segments.is_empty() {
        return node;
    }
    let segment = segments[0];
    let idx = match node.children.iter().position(|c| c.name == segment) {
        Some(i) => i,
        None => {
            node.children.push(ConfigNode::new(segment));
            node.children.len() - 1
        }
    };
    ensure_path(&mut node.children[idx], &segments[1..])
}

fn wrap_under(segments: &[&str], inner: &ConfigNode) -> ConfigNode {
    let mut node = ConfigNode::new(segments[0]);
    if segments.len() == 1 {
        node.value = inner.value.clone();
        node.attributes = inner.attributes.clone();
        node.children = inner.children.clone();
    } else {
        node.add_child(wrap_under(&segments[1..], inner));
    }
    node
}

fn merge_children(
    dst: &mut ConfigNode,
    src: &ConfigNode,
    combiner: NodeCombiner,
    list_keys: &HashSet<String>,
    path: &str,
) {
    for child in src.children() {
        let child_path = if path.is_empty() {
            child.name().to_string()
        } else {
            format!("{path}.{}", child.name())
        };
        let is_list = list_keys.contains(child_path.as_str());

        match combiner {
            NodeCombiner::Union => dst.add_child(child.clone()),
            NodeCombiner::Override => {
                if is_list {
                    dst.add_child(child.clone());
                } else if let Some(existing) = dst.child_named_mut(child.name()) {
                    if let Some(value) = child.value() {
                        existing.set_value(value.clone());
                    }
                    for (k, v) in child.attributes() {
                        existing.set_attribute(k, v);
                    }
                    merge_children(existing, child, combiner, list_keys, &child_path);
                } else {
                    dst.add_child(child.clone());
                }
            }
        }
    }
}

fn split_node_lists(node: &mut ConfigNode, delimiter: char) {
    let mut rebuilt = Vec::with_capacity(node.children.len());
    for mut child in std::mem::take(&mut node.children) {
        let split = match child.value() {
            Some(Value::String(s)) if s.contains(delimiter) => Some(
                s.split(delimiter)
                    .map(|part| part.trim().to_string())
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };
        if let Some(parts) = split {
            for part in parts {
                let mut piece = ConfigNode::leaf(child.name.clone(), part);
                piece.attributes = child.attributes.clone();
                rebuilt.push(piece);
            }
        } else {
            split_node_lists(&mut child, delimiter);
            rebuilt.push(child);
        }
    }
    node.children = rebuilt;
}

fn append_from_value(parent: &mut ConfigNode, name: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut node = ConfigNode::new(name);
            for (k, v) in map {
                append_from_value(&mut node, k, v);
            }
            parent.add_child(node);
        }
        Value::Array(items) => {
            for item in items {
                append_from_value(parent, name, item);
            }
        }
        scalar => parent.add_child(ConfigNode::leaf(name, scalar.clone())),
    }
}

fn node_to_value(node: &ConfigNode) -> Value {
    if node.children.is_empty() {
        return node.value.clone().unwrap_or(Value::Null);
    }
    let mut map = serde_json::Map::new();
    for child in &node.children {
        let rendered = node_to_value(child);
        match map.get_mut(child.name()) {
            Some(Value::Array(items)) => items.push(rendered),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, rendered]);
            }
            None => {
                map.insert(child.name().to_string(), rendered);
            }
        }
    }
    Value::Object(map)
}
