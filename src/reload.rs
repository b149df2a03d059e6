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

//! Reload detection and aggregation.
//!
//! A [`ReloadingController`] wraps a [`ReloadDetector`] and latches into a
//! "reloading" state once the detector reports a change; the owning builder
//! clears the latch after it has reloaded. A [`ReloadAggregator`] composes
//! many controllers into one composite decision: it invokes every member on
//! each check (so per-member bookkeeping stays consistent) and reports true
//! if any member does.

use indexmap::IndexMap;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

/// Default throttle between filesystem checks.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// The composite reload contract: "has the backing source changed?" plus a
/// reset of that bookkeeping.
pub trait ReloadHandle: Send + Sync {
    fn check_for_reloading(&self) -> bool;
    fn reset_reloading_state(&self);
}

/// Detects whether a backing source has changed since the last reload.
pub trait ReloadDetector: Send + Sync {
    /// Whether the source has changed. May throttle its own checks.
    fn is_reloading_required(&self) -> bool;

    /// The owner has reloaded; accept the current source state as the new
    /// baseline.
    fn reloading_performed(&self);
}

/// Latching controller over a single detector.
pub struct ReloadingController {
    detector: Arc<dyn ReloadDetector>,
    reloading: AtomicBool,
}

impl ReloadingController {
    pub fn new(detector: Arc<dyn ReloadDetector>) -> Self {
        Self {
            detector,
            reloading: AtomicBool::new(false),
        }
    }

    pub fn is_in_reloading_state(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }
}

impl ReloadHandle for ReloadingController {
    fn check_for_reloading(&self) -> bool {
        if self.reloading.load(Ordering::SeqCst) {
            return true;
        }
        if self.detector.is_reloading_required() {
            debug!("reload detected, entering reloading state");
            self.reloading.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn reset_reloading_state(&self) {
        if self.reloading.swap(false, Ordering::SeqCst) {
            self.detector.reloading_performed();
        }
    }
}

#[derive(Default)]
struct FileDetectorState {
    last_checked: Option<Instant>,
    known_modified: Option<SystemTime>,
}

/// Detects changes to a file via its modification timestamp, throttled by a
/// refresh delay.
pub struct FileReloadDetector {
    path: PathBuf,
    refresh_delay: Duration,
    state: Mutex<FileDetectorState>,
}

impl FileReloadDetector {
    pub fn new(path: impl Into<PathBuf>, refresh_delay: Duration) -> Self {
        let path = path.into();
        let known_modified = read_modified(&path);
        Self {
            path,
            refresh_delay,
            state: Mutex::new(FileDetectorState {
                last_checked: None,
                known_modified,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

impl ReloadDetector for FileReloadDetector {
    fn is_reloading_required(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = state.last_checked {
            if last.elapsed() < self.refresh_delay {
                return false;
            }
        }
        state.last_checked = Some(Instant::now());

        let current = read_modified(&self.path);
        match (state.known_modified, current) {
            (Some(known), Some(now)) => known != now,
            (None, Some(_)) => true,
            // A vanished file is not a change we can reload from
            _ => false,
        }
    }

    fn reloading_performed(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.known_modified = read_modified(&self.path);
        state.last_checked = None;
    }
}

/// Composite controller over zero or more member reload handles, keyed by
/// the owning child builder's name so members can be removed when that child
/// is reset. The aggregator consults its members; it does not own the
/// builders themselves.
#[derive(Default)]
pub struct ReloadAggregator {
    members: RwLock<IndexMap<String, Arc<dyn ReloadHandle>>>,
}

impl ReloadAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handle(&self, name: impl Into<String>, handle: Arc<dyn ReloadHandle>) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handle);
    }

    pub fn remove_handle(&self, name: &str) -> bool {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(name)
            .is_some()
    }

    pub fn clear(&self) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ReloadHandle>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl ReloadHandle for ReloadAggregator {
    /// Evaluates every member (no member is skipped once one reports true,
    /// so each member's bookkeeping stays consistent) and returns true if
    /// any member returned true.
    fn check_for_reloading(&self) -> bool {
        let mut any = false;
        for member in self.snapshot() {
            if member.check_for_reloading() {
                any = true;
            }
        }
        any
    }

    fn reset_reloading_state(&self) {
        for member in self.snapshot() {
            member.reset_reloading_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedDetector {
        required: bool,
        checks: AtomicUsize,
        performed: AtomicUsize,
    }

    impl FixedDetector {
        fn new(required: bool) -> Arc<Self> {
            Arc::new(Self {
                required,
                checks: AtomicUsize::new(0),
                performed: AtomicUsize::new(0),
            })
        }
    }

    impl ReloadDetector for FixedDetector {
        fn is_reloading_required(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.required
        }

        fn reloading_performed(&self) {
            self.performed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_controller_latches_until_reset() {
        let detector = FixedDetector::new(true);
        let controller = ReloadingController::new(detector.clone());

        assert!(controller.check_for_reloading());
        assert!(controller.is_in_reloading_state());
        // Latched: the detector is not consulted again
        assert!(controller.check_for_reloading());
        assert_eq!(detector.checks.load(Ordering::SeqCst), 1);

        controller.reset_reloading_state();
        assert!(!controller.is_in_reloading_state());
        assert_eq!(detector.performed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_without_reloading_state_is_noop() {
        let detector = FixedDetector::new(false);
        let controller = ReloadingController::new(detector.clone());

        controller.reset_reloading_state();
        assert_eq!(detector.performed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_aggregator_invokes_every_member_exactly_once() {
        let detectors = [
            FixedDetector::new(false),
            FixedDetector::new(true),
            FixedDetector::new(false),
        ];
        let aggregator = ReloadAggregator::new();
        for (i, detector) in detectors.iter().enumerate() {
            aggregator.add_handle(
                format!("child{i}"),
                Arc::new(ReloadingController::new(detector.clone())) as Arc<dyn ReloadHandle>,
            );
        }

        assert!(aggregator.check_for_reloading());
        for detector in &detectors {
            assert_eq!(detector.checks.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_aggregator_reset_resets_all_members() {
        let detectors = [FixedDetector::new(true), FixedDetector::new(true)];
        let aggregator = ReloadAggregator::new();
        for (i, detector) in detectors.iter().enumerate() {
            aggregator.add_handle(
                format!("child{i}"),
                Arc::new(ReloadingController::new(detector.clone())) as Arc<dyn ReloadHandle>,
            );
        }

        assert!(aggregator.check_for_reloading());
        aggregator.reset_reloading_state();
        for detector in &detectors {
            assert_eq!(detector.performed.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_empty_aggregator_reports_no_reload() {
        let aggregator = ReloadAggregator::new();
        assert!(!aggregator.check_for_reloading());
    }

    #[test]
    fn test_remove_handle() {
        let aggregator = ReloadAggregator::new();
        let detector = FixedDetector::new(true);
        aggregator.add_handle(
            "child",
            Arc::new(ReloadingController::new(detector)) as Arc<dyn ReloadHandle>,
        );

        assert!(aggregator.remove_handle("child"));
        assert!(!aggregator.remove_handle("child"));
        assert!(!aggregator.check_for_reloading());
    }

    #[test]
    fn test_file_detector_sees_modification() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        fs::write(file.path(), "a: 1\n").expect("write fixture");

        let detector = FileReloadDetector::new(file.path(), Duration::ZERO);
        assert!(!detector.is_reloading_required());

        // Backdate the recorded mtime instead of sleeping
        {
            let mut state = detector.state.lock().expect("lock");
            state.known_modified = Some(SystemTime::UNIX_EPOCH);
            state.last_checked = None;
        }
        assert!(detector.is_reloading_required());

        detector.reloading_performed();
        assert!(!detector.is_reloading_required());
    }

    #[test]
    fn test_file_detector_throttles_by_refresh_delay() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        fs::write(file.path(), "a: 1\n").expect("write fixture");

        let detector = FileReloadDetector::new(file.path(), Duration::from_secs(3600));
        assert!(!detector.is_reloading_required());

        // Even with a backdated baseline the throttle suppresses the check
        {
            let mut state = detector.state.lock().expect("lock");
            state.known_modified = Some(SystemTime::UNIX_EPOCH);
        }
        assert!(!detector.is_reloading_required());
    }
}
