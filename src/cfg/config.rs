// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Settings that govern a single `Connection` to a local relay.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionConfig {
    /// Default admission limits for services registered without explicit
    /// overrides.
    #[serde(default, rename = "Service")]
    pub service: ServiceLimits,

    /// Default admission limits for topics subscribed to without explicit
    /// overrides.
    #[serde(default, rename = "Topic")]
    pub topic: TopicLimits,

    /// Timeout applied to individual socket reads/writes.
    #[serde(default = "default_io_timeout", rename = "IoTimeout", with = "serde_millis")]
    pub io_timeout: Duration,

    /// Bytes of credit granted to a new tunnel endpoint's peer before it must
    /// send anything.
    #[serde(default = "default_tunnel_buffer", rename = "TunnelBuffer")]
    pub tunnel_buffer: u64,
}

/// Admission limits applied to a service's broadcast and request worker
/// pools.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServiceLimits {
    #[serde(default = "default_threads", rename = "BroadcastThreads")]
    pub broadcast_threads: usize,
    #[serde(default = "default_memory", rename = "BroadcastMemory")]
    pub broadcast_memory: i64,
    #[serde(default = "default_threads", rename = "RequestThreads")]
    pub request_threads: usize,
    #[serde(default = "default_memory", rename = "RequestMemory")]
    pub request_memory: i64,
}

/// Admission limits applied to a single topic's event worker pool.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TopicLimits {
    #[serde(default = "default_threads", rename = "EventThreads")]
    pub event_threads: usize,
    #[serde(default = "default_memory", rename = "EventMemory")]
    pub event_memory: i64,
}

fn default_threads() -> usize {
    4 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn default_memory() -> i64 {
    64 * 1024 * 1024
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tunnel_buffer() -> u64 {
    64 * 1024 * 1024
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            broadcast_threads: default_threads(),
            broadcast_memory: default_memory(),
            request_threads: default_threads(),
            request_memory: default_memory(),
        }
    }
}

impl Default for TopicLimits {
    fn default() -> Self {
        Self {
            event_threads: default_threads(),
            event_memory: default_memory(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service: ServiceLimits::default(),
            topic: TopicLimits::default(),
            io_timeout: default_io_timeout(),
            tunnel_buffer: default_tunnel_buffer(),
        }
    }
}

impl ConnectionConfig {
    /// Loads configuration from YAML, validating it before returning.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: ConnectionConfig =
            serde_yaml::from_str(&s).context("failed to parse connection config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.service.broadcast_threads >= 1, "BroadcastThreads must be >= 1");
        ensure!(self.service.request_threads >= 1, "RequestThreads must be >= 1");
        ensure!(self.topic.event_threads >= 1, "EventThreads must be >= 1");
        ensure!(self.service.broadcast_memory >= 0, "BroadcastMemory must be >= 0");
        ensure!(self.service.request_memory >= 0, "RequestMemory must be >= 0");
        ensure!(self.topic.event_memory >= 0, "EventMemory must be >= 0");
        ensure!(self.tunnel_buffer > 0, "TunnelBuffer must be > 0");
        Ok(())
    }
}

/// Serde helper for representing a `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
