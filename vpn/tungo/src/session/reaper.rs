// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Periodic maintenance: evicts peers that stopped producing authenticated
//! traffic.

use crate::session::SessionRepository;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Scans for idle peers until cancelled.
///
/// The scan cadence is a fraction of the timeout so a peer overstays by at
/// most half the timeout, without waking up busily.
pub async fn run_reaper(
    repository: Arc<SessionRepository>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let cadence = (idle_timeout / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        // the tokio clock keeps tests on virtual time
        let reaped = repository.reap_idle(tokio::time::Instant::now().into_std(), idle_timeout);
        if reaped > 0 {
            tracing::debug!(reaped, "idle peers closed");
        }
    }
}
