//! Public façade over a live [`Driver`]: thin, validating wrappers around
//! the four schemes.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    cfg::{
        config::{ConnectionConfig, TopicLimits},
        validators::{validate_remote_cluster, validate_topic},
    },
    driver::{Driver, Handlers},
    error::Result,
    handler::TopicHandler,
    tunnel_handle::Tunnel,
};

/// A live connection to a local relay, multiplexing all four sub-protocols.
pub struct Connection {
    driver: Arc<Driver>,
    cfg: ConnectionConfig,
}

impl Connection {
    pub(crate) async fn open(port: u16, cluster: &str, cfg: ConnectionConfig, handlers: Handlers) -> Result<Self> {
        let driver = Driver::connect(port, cluster, &cfg, handlers).await?;
        Ok(Self { driver, cfg })
    }

    pub async fn broadcast(&self, cluster: &str, message: Bytes) -> Result<()> {
        validate_remote_cluster(cluster)?;
        self.driver.broadcast.broadcast(cluster, message).await
    }

    pub async fn request(&self, cluster: &str, message: Bytes, timeout_ms: u64) -> Result<Bytes> {
        validate_remote_cluster(cluster)?;
        self.driver.request.request(cluster, message, timeout_ms).await
    }

    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> Result<()> {
        self.subscribe_with_limits(topic, handler, &self.cfg.topic.clone()).await
    }

    pub async fn subscribe_with_limits(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
        limits: &TopicLimits,
    ) -> Result<()> {
        validate_topic(topic)?;
        self.driver.publish.subscribe(topic, handler, limits).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        validate_topic(topic)?;
        self.driver.publish.unsubscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, message: Bytes) -> Result<()> {
        validate_topic(topic)?;
        self.driver.publish.publish(topic, message).await
    }

    pub async fn tunnel(&self, cluster: &str, timeout_ms: u64) -> Result<Tunnel> {
        validate_remote_cluster(cluster)?;
        self.driver.tunnel.tunnel(cluster, timeout_ms).await
    }

    pub async fn close(&self) -> Result<()> {
        self.driver.close().await
    }
}
