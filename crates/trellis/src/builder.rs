/*
 *  Copyright 2025 Trellis Contributors
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Job Tree Builder
//!
//! An in-memory, recursive builder used by callers to describe a job plus its
//! children before any of it is committed to the job store. A builder node has
//! no identity until `Scheduler::add_tree` commits it depth-first (root
//! first); each node is then stamped with its assigned id so the caller can
//! reference it, e.g. to graft another tree onto a specific child later.

use crate::models::JobId;
use crate::store::TreeContext;
use std::collections::BTreeSet;

/// A transient description of one job and its children.
#[derive(Debug, Default)]
pub struct JobTreeBuilder {
    work_type: String,
    parameters: serde_json::Value,
    title: String,
    node: Option<String>,
    context: TreeContext,
    tags: BTreeSet<String>,
    abort_handler: bool,
    children: Vec<JobTreeBuilder>,
    assigned_id: Option<JobId>,
}

impl JobTreeBuilder {
    /// Describes a job performed by the `work_type` plugin with `parameters`.
    pub fn new(
        work_type: impl Into<String>,
        parameters: serde_json::Value,
        title: impl Into<String>,
    ) -> Self {
        JobTreeBuilder {
            work_type: work_type.into(),
            parameters,
            title: title.into(),
            ..Default::default()
        }
    }

    /// Assigns the job to a specific worker node. Without this, the
    /// committing scheduler's own node is used.
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Seeds entries into the tree context at commit time.
    pub fn with_context(mut self, context: TreeContext) -> Self {
        self.context = context;
        self
    }

    /// Attaches retrieval tags. Only meaningful on the root of a committed
    /// tree; the store ignores tags on non-roots.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Flags this job to run its plugin's cleanup entry point whenever the
    /// tree is aborted, regardless of whether the job itself ever ran.
    pub fn abort_handler(mut self) -> Self {
        self.abort_handler = true;
        self
    }

    /// Appends a child job; the parent's own action starts only once every
    /// child has reached success.
    pub fn add_child(mut self, child: JobTreeBuilder) -> Self {
        self.children.push(child);
        self
    }

    /// The id assigned at commit, or `None` before commit.
    pub fn assigned_id(&self) -> Option<JobId> {
        self.assigned_id
    }

    pub fn work_type(&self) -> &str {
        &self.work_type
    }

    pub fn parameters(&self) -> &serde_json::Value {
        &self.parameters
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn context(&self) -> &TreeContext {
        &self.context
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn is_abort_handler(&self) -> bool {
        self.abort_handler
    }

    pub fn children(&self) -> &[JobTreeBuilder] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut [JobTreeBuilder] {
        &mut self.children
    }

    pub(crate) fn stamp(&mut self, id: JobId) {
        self.assigned_id = Some(id);
    }
}
