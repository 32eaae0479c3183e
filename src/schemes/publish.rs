//! Publish/subscribe scheme: a topic registry, one worker pool per
//! subscribed topic.
//!
//! Grounded in the teacher's `client/pool_sessions.rs::Pool`: a keyed map of
//! live resources (there, sessions; here, subscriptions), each with its own
//! lifecycle independent of the others.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::warn;

use crate::{
    cfg::config::TopicLimits,
    error::{Error, Result},
    handler::TopicHandler,
    pool::{BoundedWorkerPool, TerminateMode},
    wire::{FrameBuilder, FrameWriter, Opcode},
};

struct Subscription {
    handler: Arc<dyn TopicHandler>,
    pool: BoundedWorkerPool,
}

pub struct PublishScheme {
    writer: Arc<FrameWriter>,
    subscriptions: DashMap<String, Subscription>,
}

impl PublishScheme {
    pub fn new(writer: Arc<FrameWriter>) -> Self {
        Self {
            writer,
            subscriptions: DashMap::new(),
        }
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
        limits: &TopicLimits,
    ) -> Result<()> {
        let sub = Subscription {
            handler,
            pool: BoundedWorkerPool::new(limits.event_threads, limits.event_memory),
        };
        // Entry API keeps the insert-before-write order race-free against a
        // concurrent unsubscribe/re-subscribe of the same topic.
        match self.subscriptions.entry(topic.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Argument(format!("already subscribed to topic {topic:?}")));
            },
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(sub);
            },
        }
        self.writer.send(FrameBuilder::new(Opcode::Subscribe).string(topic)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let (_, sub) = self
            .subscriptions
            .remove(topic)
            .ok_or_else(|| Error::Argument(format!("not subscribed to topic {topic:?}")))?;
        self.writer.send(FrameBuilder::new(Opcode::Unsubscribe).string(topic)).await?;
        sub.pool.terminate(TerminateMode::Graceful).await;
        Ok(())
    }

    pub async fn publish(&self, topic: &str, message: Bytes) -> Result<()> {
        self.writer.send(FrameBuilder::new(Opcode::Publish).string(topic).binary(&message)).await
    }

    /// Invoked by the driver once it has parsed a `PUBLISH` frame's fields.
    pub async fn on_publish(&self, topic: String, message: Bytes) {
        // Clone the handler and pool out of the map before awaiting: holding
        // a DashMap shard guard across `pool.schedule`'s await would block
        // an unrelated `unsubscribe` on the same shard for the duration.
        let (handler, pool) = {
            let Some(sub) = self.subscriptions.get(&topic) else {
                warn!("dropping event for unknown topic {topic:?}");
                return;
            };
            (sub.handler.clone(), sub.pool.clone())
        };
        let cost = message.len() as i64;
        let topic_for_task = topic.clone();
        let admitted = pool
            .schedule(cost, 0, move |cancel| async move {
                // Isolate the handler on its own task: a panic becomes a
                // `JoinError` here rather than aborting the worker pool's
                // own task, and an immediate shutdown can abort it outright.
                let mut handle =
                    tokio::spawn(async move { handler.handle_event(&topic_for_task, message).await });
                let outcome = tokio::select! {
                    r = &mut handle => r,
                    _ = cancel.cancelled() => {
                        handle.abort();
                        return;
                    },
                };
                if let Err(join_err) = outcome {
                    warn!("topic event handler panicked: {join_err}");
                }
            })
            .await;
        if !admitted {
            warn!("dropped event for topic {topic:?}: worker pool rejected admission");
        }
    }

    pub async fn shutdown(&self, mode: TerminateMode) {
        for entry in self.subscriptions.iter() {
            entry.value().pool.terminate(mode).await;
        }
    }
}
