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

//! Status Bus
//!
//! A single logical channel carrying job lifecycle transitions between nodes.
//! Every node subscribes once at startup; delivery is at-least-once and
//! best-effort ordered. The cross-node invariant is eventual convergence:
//! given a delivered `WAITING`/`SUCCESS` message (or a local trigger), every
//! node eventually re-evaluates and discovers jobs it owns that became
//! runnable.
//!
//! The networked transport is an external collaborator; [`BroadcastBus`] is
//! the in-process reference implementation used for single-process clusters
//! and tests.

use crate::error::BusError;
use crate::models::StatusMessage;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

/// Publish/subscribe channel for job status messages.
#[async_trait]
pub trait StatusBus: Send + Sync {
    /// Broadcasts a status message to every subscribed node, the sender
    /// included. Senders filter out their own messages on receipt.
    async fn publish(&self, message: StatusMessage) -> Result<(), BusError>;

    /// Subscribes to the channel. Messages published before the call are not
    /// delivered.
    fn subscribe(&self) -> broadcast::Receiver<StatusMessage>;
}

/// In-process status bus over a tokio broadcast channel.
pub struct BroadcastBus {
    tx: broadcast::Sender<StatusMessage>,
}

impl BroadcastBus {
    const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// A bus whose subscribers may lag by at most `capacity` messages before
    /// older ones are dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastBus { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusBus for BroadcastBus {
    async fn publish(&self, message: StatusMessage) -> Result<(), BusError> {
        trace!(job_id = %message.job_id, state = %message.state, source = %message.source_node, "Publishing status");
        // No subscribers is not an error; a single-node cluster still works.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusMessage> {
        self.tx.subscribe()
    }
}
