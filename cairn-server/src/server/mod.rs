mod background;
mod handlers;

use crate::config::Config;
use cairn_core::{
    BlobStore, ConfigHandle, FileCatalog, HttpTransport, NodeContext, Result, cluster_scheduler,
    init_cluster_config, load_cluster_config, spawn_task_workers,
};
use axum::{
    Router,
    routing::{get, put},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub ctx: Arc<NodeContext>,
    pub catalog: FileCatalog,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/.cairn/blob/:oid",
            put(handlers::put_blob)
                .get(handlers::get_blob)
                .head(handlers::head_blob)
                .delete(handlers::delete_blob),
        )
        .route("/.cairn/fetch/:oid", get(handlers::request_fetch))
        .route("/.cairn/nodes", get(handlers::list_nodes))
        .route("/.cairn/config", get(handlers::show_config))
        .route("/.cairn/fsck", get(handlers::fsck_all))
        .route("/.cairn/fsck/*prefix", get(handlers::fsck))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let node_id = config.resolve_node_id()?;

    let store = config.store.builder(&config.data_dir).build().await?;
    if init_cluster_config(store.as_ref()).await? {
        tracing::info!("Initialized default cluster config");
    }
    let cluster_config = load_cluster_config(store.as_ref()).await?;
    cluster_config.validate()?;

    let blobs = BlobStore::new(config.data_dir.clone())?;
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
        config.peer_timeout_secs,
    ))?);
    let ctx = Arc::new(NodeContext::new(
        config.node_settings(node_id),
        store.clone(),
        ConfigHandle::new(cluster_config),
        blobs,
        transport,
    ));

    let node = ctx.heartbeat().await?;
    tracing::info!(
        "Node ID: {}, Address: {}, Capacity: {} bytes",
        node.node_id,
        node.address(),
        node.total_bytes
    );

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    handles.push(tokio::spawn(background::heartbeat_loop(
        ctx.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(background::config_refresh_loop(
        ctx.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(background::reconcile_loop(
        ctx.clone(),
        cancel.clone(),
    )));
    handles.extend(spawn_task_workers(
        ctx.clone(),
        ctx.settings.task_workers,
        cancel.clone(),
    ));
    handles.extend(cluster_scheduler(ctx.clone()).spawn(cancel.clone()));

    let state = Arc::new(ServerState {
        catalog: FileCatalog::new(store),
        ctx,
    });
    let app = router(state);

    let listen_addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("Server listening on {}", listen_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", error);
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use cairn_core::{ClusterConfig, MetaStore, NodeSettings, StoreBuilder, compute_hash};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state(dir: &TempDir) -> Arc<ServerState> {
        let store: Arc<dyn MetaStore> = StoreBuilder::new()
            .backend("memory")
            .namespace("test")
            .build()
            .await
            .unwrap();
        let settings = NodeSettings {
            node_id: "node-a".to_string(),
            addr: "127.0.0.1".to_string(),
            bind_addr: ":8484".to_string(),
            capacity_bytes: 1 << 30,
            task_queue_size: 4,
            task_workers: 1,
            verify_workers: 1,
        };
        let ctx = Arc::new(NodeContext::new(
            settings,
            store.clone(),
            ConfigHandle::new(ClusterConfig::default()),
            BlobStore::new(dir.path().to_path_buf()).unwrap(),
            Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
        ));
        ctx.heartbeat().await.unwrap();
        Arc::new(ServerState {
            catalog: FileCatalog::new(store),
            ctx,
        })
    }

    fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_blob_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let app = router(state.clone());
        let oid = compute_hash(b"hello cairn");
        let uri = format!("/.cairn/blob/{}", oid);

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, Body::from("hello cairn")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(state.ctx.ledger.get(&oid).await.unwrap().is_some());

        let response = app
            .clone()
            .oneshot(request("GET", &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello cairn");

        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.ctx.ledger.get(&oid).await.unwrap().is_none());

        let response = app
            .oneshot(request("HEAD", &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_hash() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir).await);
        let uri = format!("/.cairn/blob/{}", compute_hash(b"expected"));

        let response = app
            .oneshot(request("PUT", &uri, Body::from("something else")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fetch_request_queues_or_refuses() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let app = router(state.clone());

        for i in 0..4 {
            let uri = format!("/.cairn/fetch/{}", compute_hash(format!("blob {}", i).as_bytes()));
            let response = app
                .clone()
                .oneshot(request("GET", &uri, Body::empty()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        let uri = format!("/.cairn/fetch/{}", compute_hash(b"one too many"));
        let response = app.oneshot(request("GET", &uri, Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.ctx.tasks.pending(), 4);
    }
}
