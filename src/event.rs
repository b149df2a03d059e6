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

//! Builder lifecycle notifications.
//!
//! Listeners are carried in a [`crate::parameters::ParameterSet`], attached
//! to a builder when it is constructed, and detached when the owning builder
//! or cache is reset.

/// Observer of builder lifecycle events. All methods default to no-ops so
/// implementors only override what they care about.
pub trait BuilderListener: Send + Sync {
    /// A builder finished producing (and publishing) a new result.
    fn on_result_created(&self) {}

    /// A builder discarded its result.
    fn on_reset(&self) {}
}
