use cairn_core::{ClusterConfig, ConfigHandle, NodeContext};
use cairn_core::operations::{
    GrabSomeDataOperation, GrabSomeDataOperationRequest, ValidateLocalOperation,
    ValidateLocalOperationRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `period`, returning false if cancelled first.
async fn pause(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

/// Wait one period of the loop `name`. While the period is zero the loop is
/// parked until a config change gives it a positive one. Returns false if
/// cancelled first.
async fn wait_period(
    config: &ConfigHandle,
    name: &str,
    period_of: fn(&ClusterConfig) -> Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut changes = config.changes();
    let mut parked = false;
    loop {
        let period = period_of(&config.current());
        if !period.is_zero() {
            if parked {
                tracing::info!("loop resumed loop={} period={:?}", name, period);
            }
            return pause(period, cancel).await;
        }
        if !parked {
            tracing::warn!("loop paused, zero frequency loop={}", name);
            parked = true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = changes.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

pub async fn heartbeat_loop(ctx: Arc<NodeContext>, cancel: CancellationToken) {
    loop {
        if !wait_period(&ctx.config, "heartbeat", |c| c.heartbeat_freq, &cancel).await {
            break;
        }
        match ctx.heartbeat().await {
            Ok(node) => tracing::debug!(
                "heartbeat node_id={} used_bytes={}",
                node.node_id,
                node.used_bytes
            ),
            Err(error) => tracing::warn!("heartbeat failed: {}", error),
        }
    }
    tracing::info!("Heartbeat loop stopped");
}

pub async fn config_refresh_loop(ctx: Arc<NodeContext>, cancel: CancellationToken) {
    loop {
        if !wait_period(&ctx.config, "config_refresh", |c| c.config_refresh_freq, &cancel).await {
            break;
        }
        match ctx.config.refresh(ctx.store.as_ref()).await {
            Ok(true) => tracing::info!("Cluster config changed"),
            Ok(false) => {}
            Err(error) => tracing::warn!("config refresh failed: {}", error),
        }
    }
}

/// Validates local blobs at startup and every `reconcile_freq` afterwards.
/// The first pass also pulls in some under-replicated data. A zero
/// `reconcile_freq` leaves only the startup pass.
pub async fn reconcile_loop(ctx: Arc<NodeContext>, cancel: CancellationToken) {
    let mut first = true;
    loop {
        reconcile_once(&ctx, &cancel).await;
        if first {
            first = false;
            grab_some_data(&ctx).await;
        }

        if !wait_period(&ctx.config, "reconcile", |c| c.reconcile_freq, &cancel).await {
            break;
        }
    }
}

async fn reconcile_once(ctx: &Arc<NodeContext>, cancel: &CancellationToken) {
    let request = ValidateLocalOperationRequest {
        verify_workers: ctx.settings.verify_workers,
    };
    match ValidateLocalOperation::new(ctx.clone())
        .run(request, cancel)
        .await
    {
        Ok(result) => {
            tracing::info!(
                "local validation verified={} corrupt={} missing={} tmp_removed={}",
                result.verified,
                result.corrupt,
                result.missing,
                result.tmp_removed
            );
            for error in &result.errors {
                tracing::warn!("local validation error: {}", error);
            }
        }
        Err(error) => tracing::error!("local validation failed: {}", error),
    }
}

async fn grab_some_data(ctx: &Arc<NodeContext>) {
    let config = ctx.cluster_config();
    let request = GrabSomeDataOperationRequest {
        max_objects: config.max_startup_objects,
        max_replicas: config.max_startup_repls,
    };
    match GrabSomeDataOperation::new(ctx.clone()).run(request).await {
        Ok(result) => tracing::info!(
            "startup grab examined={} queued={} queue_full={}",
            result.examined,
            result.queued,
            result.queue_full
        ),
        Err(error) => tracing::warn!("startup grab failed: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconcile_every(period: Duration) -> ClusterConfig {
        ClusterConfig {
            reconcile_freq: period,
            ..ClusterConfig::default()
        }
    }

    fn spawn_wait(
        config: &ConfigHandle,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<bool> {
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_period(&config, "reconcile", |c| c.reconcile_freq, &cancel).await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_parks_until_config_change() {
        let config = ConfigHandle::new(reconcile_every(Duration::ZERO));
        let cancel = CancellationToken::new();
        let waiting = spawn_wait(&config, &cancel);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!waiting.is_finished());

        // Another parameter changes, reconciliation stays off.
        let mut unrelated = reconcile_every(Duration::ZERO);
        unrelated.gc_limit += 1;
        assert!(config.replace(unrelated.clone()));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!waiting.is_finished());

        unrelated.reconcile_freq = Duration::from_secs(60);
        assert!(config.replace(unrelated));
        assert!(waiting.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_parked_loop() {
        let config = ConfigHandle::new(reconcile_every(Duration::ZERO));
        let cancel = CancellationToken::new();
        let waiting = spawn_wait(&config, &cancel);

        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        assert!(!waiting.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_period_sleeps_once() {
        let config = ConfigHandle::new(reconcile_every(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        assert!(wait_period(&config, "reconcile", |c| c.reconcile_freq, &cancel).await);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
