//! Replication: bootstrap from a master and pull-based log shipping.
//!
//! Every tick the node pulls, from each configured source, the entries its
//! vector clock has not covered yet. Sources relay entries of every origin,
//! so a full mesh converges even when a direct link lags. A successful pull
//! defines the clock entry for the source. A drained pull counts as caught
//! up when the local clock covers every clock the source reported.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use meshcheck_protocol::{
    JoinRequest, JoinResponse, PullRequest, PullResponse, VClock, JOIN_PATH, MAX_PULL_BATCH,
    PULL_PATH,
};
use tokio::sync::broadcast;

use crate::api::AppState;
use crate::{Result, SimError};

fn with_auth(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => req.header("Authorization", format!("Bearer {token}")),
        None => req,
    }
}

/// Ask `source` (the master) for an instance id and a snapshot.
pub async fn join(
    client: &reqwest::Client,
    source: &str,
    name: &str,
    token: Option<&str>,
) -> Result<JoinResponse> {
    let url = format!("http://{source}{JOIN_PATH}");
    let resp = with_auth(client.post(&url), token)
        .json(&JoinRequest { name: name.into() })
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(SimError::Bootstrap(format!(
            "join via {source} rejected ({status}): {text}"
        )));
    }
    Ok(resp.json().await?)
}

/// Run the pull loop until shutdown.
pub async fn run_replication_loop(
    state: Arc<AppState>,
    client: reqwest::Client,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if state.is_frozen() {
                    continue;
                }
                let sources = state.sources.read().await.clone();
                for source in sources.iter().filter(|s| **s != state.listen) {
                    match pull_from(&state, &client, source).await {
                        Ok(applied) => {
                            state.stats.pulls.fetch_add(1, Ordering::Relaxed);
                            if applied > 0 {
                                tracing::debug!(
                                    node = state.name.as_str(),
                                    source = source.as_str(),
                                    applied,
                                    "replication: applied entries"
                                );
                            }
                        }
                        Err(e) => {
                            state.stats.pull_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                node = state.name.as_str(),
                                source = source.as_str(),
                                error = %e,
                                "replication: pull failed"
                            );
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!(node = state.name.as_str(), "replication loop stopping");
                return;
            }
        }
    }
}

/// Drain everything `source` has that we have not applied yet.
async fn pull_from(state: &AppState, client: &reqwest::Client, source: &str) -> Result<usize> {
    let own = state.store.instance_id()?.ok_or(SimError::NotBootstrapped)?;
    let url = format!("http://{source}{PULL_PATH}");
    let mut applied = 0;
    let mut seen = VClock::new();

    loop {
        let request = PullRequest {
            instance_id: own,
            vclock: state.store.vclock()?,
            limit: MAX_PULL_BATCH,
        };
        let resp = with_auth(client.post(&url), state.bearer_token.as_deref())
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SimError::Command(format!("pull from {source}: {status} {text}")));
        }
        let page: PullResponse = resp.json().await?;

        // Frozen by the time we got here: drop the page.
        if state.is_frozen() {
            return Ok(applied);
        }
        state.store.define_origin(page.instance_id)?;
        seen.merge(&page.vclock);
        for entry in &page.entries {
            if state.store.apply_remote(entry)? {
                applied += 1;
                state.stats.entries_applied.fetch_add(1, Ordering::Relaxed);
            } else {
                state.stats.entries_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !page.has_more {
            break;
        }
    }

    let local = state.store.vclock()?;
    if local.covers(&seen) {
        state.stats.caught_up.fetch_add(1, Ordering::Relaxed);
    } else {
        tracing::trace!(
            node = state.name.as_str(),
            source,
            local = %local,
            remote = %seen,
            "replication: still behind source"
        );
    }
    Ok(applied)
}
