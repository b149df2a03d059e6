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

//! End-to-end tests for combined-builder composition over real definition
//! and source files.

use config_weaver::{
    BuildContext, BuilderProvider, CombinedBuilder, ConfigTree, ConfigurationBuilder,
    InMemorySource, ParameterSet, ReloadDetector, ReloadHandle, ReloadingController, Result,
    SourceBuilder, TreeSource,
};
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn write_fixture(dir: &TempDir, name: &str, content: &str) {
    fs::write(dir.path().join(name), content).expect("write fixture");
}

#[test]
fn test_file_sources_merge_with_override_semantics() {
    let dir = TempDir::new().expect("temp dir");
    write_fixture(&dir, "base.yaml", "db:\n  host: localhost\n  port: 5432\n");
    write_fixture(&dir, "prod.yaml", "db:\n  host: db.prod.example.com\n");

    let definition = "\
override:
  - tag: file
    path: base.yaml
  - tag: file
    path: prod.yaml
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );

    let config = builder.get_configuration().expect("build succeeds");
    assert_eq!(
        config.get_string("db.host"),
        Some("db.prod.example.com".to_string())
    );
    assert_eq!(config.get_i64("db.port"), Some(5432));
}

#[test]
fn test_list_key_unions_three_entries_in_source_order() {
    let dir = TempDir::new().expect("temp dir");
    write_fixture(&dir, "first.yaml", "tables:\n  table:\n    - name: users\n");
    write_fixture(
        &dir,
        "second.yaml",
        "tables:\n  table:\n    - name: orders\n    - name: items\n",
    );

    let definition = "\
list-key: tables.table
override:
  - tag: file
    path: first.yaml
  - tag: file
    path: second.yaml
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );

    let config = builder.get_configuration().expect("build succeeds");
    assert_eq!(
        config.get_list("tables.table.name"),
        vec![
            "users".to_string(),
            "orders".to_string(),
            "items".to_string()
        ]
    );
}

#[test]
fn test_optional_missing_file_is_skipped() {
    let dir = TempDir::new().expect("temp dir");
    write_fixture(&dir, "base.yaml", "app:\n  name: weaver\n");

    let definition = "\
override:
  - tag: file
    path: base.yaml
  - tag: file
    path: does-not-exist.yaml
    optional: true
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );

    let config = builder.get_configuration().expect("build succeeds");
    assert_eq!(config.get_string("app.name"), Some("weaver".to_string()));
}

#[test]
fn test_missing_required_file_is_fatal() {
    let dir = TempDir::new().expect("temp dir");

    let definition = "\
override:
  - tag: file
    path: does-not-exist.yaml
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );

    builder.get_configuration().expect_err("missing file is fatal");
}

#[test]
fn test_declaration_path_interpolates_environment() {
    let dir = TempDir::new().expect("temp dir");
    write_fixture(&dir, "env-pick.yaml", "picked: from-env\n");
    std::env::set_var("CW_IT_FILE", "env-pick.yaml");

    let definition = "\
override:
  - tag: file
    path: ${CW_IT_FILE}
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );

    let config = builder.get_configuration().expect("build succeeds");
    assert_eq!(config.get_string("picked"), Some("from-env".to_string()));
}

/// Reload-capable provider whose detector records every check.
struct CountingDetector {
    required: bool,
    checks: AtomicUsize,
}

impl ReloadDetector for CountingDetector {
    fn is_reloading_required(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.required
    }

    fn reloading_performed(&self) {}
}

struct ReloadingTreeProvider {
    detector: Arc<CountingDetector>,
    tree: ConfigTree,
}

impl BuilderProvider for ReloadingTreeProvider {
    fn create_builder(&self, _ctx: &BuildContext) -> Result<Arc<dyn ConfigurationBuilder>> {
        Ok(Arc::new(SourceBuilder::new(Arc::new(TreeSource::new(
            self.tree.clone(),
        )))))
    }

    fn supports_reloading(&self) -> bool {
        true
    }

    fn create_reloading_builder(
        &self,
        _ctx: &BuildContext,
    ) -> Result<Arc<dyn ConfigurationBuilder>> {
        let controller = Arc::new(ReloadingController::new(self.detector.clone()));
        Ok(Arc::new(
            SourceBuilder::new(Arc::new(TreeSource::new(self.tree.clone())))
                .with_controller(controller),
        ))
    }
}

#[test]
fn test_aggregated_reload_check_invokes_every_member_once() {
    let definition = "\
override:
  - tag: alpha
    config-reload: true
  - tag: beta
    config-reload: true
  - tag: gamma
    config-reload: true
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));

    let detectors: Vec<Arc<CountingDetector>> = [false, true, false]
        .iter()
        .map(|&required| {
            Arc::new(CountingDetector {
                required,
                checks: AtomicUsize::new(0),
            })
        })
        .collect();
    for (tag, detector) in ["alpha", "beta", "gamma"].iter().zip(&detectors) {
        let mut tree = ConfigTree::new();
        tree.set_string(&format!("{tag}.key"), "v");
        builder
            .register_provider(
                *tag,
                Arc::new(ReloadingTreeProvider {
                    detector: detector.clone(),
                    tree,
                }),
            )
            .expect("register");
    }
    builder.configure(ParameterSet::new());
    builder.get_configuration().expect("build succeeds");

    let aggregator = builder.reload_aggregator();
    assert_eq!(aggregator.len(), 3);

    assert!(aggregator.check_for_reloading());
    for detector in &detectors {
        assert_eq!(detector.checks.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_changed_child_triggers_remerge() {
    let definition = "\
override:
  - tag: live
    config-reload: true
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    let detector = Arc::new(CountingDetector {
        required: true,
        checks: AtomicUsize::new(0),
    });
    let mut tree = ConfigTree::new();
    tree.set_string("live.key", "v");
    builder
        .register_provider(
            "live",
            Arc::new(ReloadingTreeProvider {
                detector,
                tree,
            }),
        )
        .expect("register");
    builder.configure(ParameterSet::new());

    let first = builder.get_configuration().expect("build succeeds");
    // The detector reports a change, so the next access re-merges
    let second = builder.get_configuration().expect("rebuild succeeds");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.get_string("live.key"), Some("v".to_string()));
}

#[test]
fn test_published_result_is_safe_for_concurrent_reads() {
    let dir = TempDir::new().expect("temp dir");
    write_fixture(
        &dir,
        "shared.yaml",
        "app:\n  name: weaver\n  replicas: 4\n",
    );

    let definition = "\
override:
  - tag: file
    path: shared.yaml
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );
    let config = builder.get_configuration().expect("build succeeds");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    assert_eq!(config.get_string("app.name"), Some("weaver".to_string()));
                    assert_eq!(config.get_i64("app.replicas"), Some(4));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("reader thread panicked");
    }
}

#[test]
fn test_nested_combined_definition_over_files() {
    let dir = TempDir::new().expect("temp dir");
    write_fixture(&dir, "creds.yaml", "user: admin\npassword: hunter2\n");
    write_fixture(&dir, "app.yaml", "app:\n  name: weaver\n");

    let definition = "\
override:
  - tag: file
    path: app.yaml
  - tag: combined
    config-at: db
    override:
      - tag: file
        path: creds.yaml
";
    let builder = CombinedBuilder::new()
        .with_definition_source(Arc::new(InMemorySource::new(definition)));
    builder.configure(
        ParameterSet::new().with_base_path(dir.path().display().to_string()),
    );

    let config = builder.get_configuration().expect("build succeeds");
    assert_eq!(config.get_string("app.name"), Some("weaver".to_string()));
    assert_eq!(config.get_string("db.user"), Some("admin".to_string()));
    assert_eq!(config.get_string("db.password"), Some("hunter2".to_string()));
}
