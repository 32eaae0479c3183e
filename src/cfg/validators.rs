//! Argument validators invoked synchronously, before anything touches the
//! wire.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::error::{Error, Result};

/// Validates a cluster name addressed by a remote call (`broadcast`,
/// `request`, `tunnel`): must be non-empty.
pub fn validate_remote_cluster(cluster: &str) -> Result<()> {
    if cluster.is_empty() {
        return Err(Error::Argument("cluster name must not be empty".into()));
    }
    Ok(())
}

/// Validates the cluster name a service registers itself under: non-empty
/// and free of `:`, since the relay uses `:` to separate address components
/// internally.
pub fn validate_local_cluster(cluster: &str) -> Result<()> {
    if cluster.is_empty() {
        return Err(Error::Argument("local cluster name must not be empty".into()));
    }
    if cluster.contains(':') {
        return Err(Error::Argument(format!(
            "local cluster name must not contain ':': {cluster:?}"
        )));
    }
    Ok(())
}

/// Validates a topic name used by `subscribe`/`unsubscribe`/`publish`.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Argument("topic name must not be empty".into()));
    }
    Ok(())
}
