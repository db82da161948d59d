use crate::error::{CairnError, Result};
use crate::nodes::StorageNode;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;

/// Header naming the node a fetch is taking a copy over from.
pub const PREV_NODE_HEADER: &str = "x-prevnode";

pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// Blob movement between nodes.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Stream a blob from a peer.
    async fn open_blob(&self, node: &StorageNode, oid: &str) -> Result<BlobStream>;

    /// Ask a peer to drop its copy. Absent copies count as deleted.
    async fn delete_blob(&self, node: &StorageNode, oid: &str) -> Result<()>;

    /// Ask a peer to fetch a copy for itself, optionally taking over from `prev`.
    async fn request_fetch(&self, node: &StorageNode, oid: &str, prev: Option<&str>)
    -> Result<()>;
}

/// Transport talking to peers' `/.cairn/` endpoints.
///
/// `timeout` bounds connecting, waiting for a response and each body read.
/// Control calls are also bounded as a whole; blob bodies may stream for
/// longer as long as they keep moving.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|error| CairnError::Http(error.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn parse(url: String) -> Result<Url> {
        Url::parse(&url).map_err(|error| CairnError::Http(format!("invalid url {}: {}", url, error)))
    }

    async fn send(&self, request: RequestBuilder, node: &StorageNode) -> Result<Response> {
        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(sent) => sent.map_err(|error| CairnError::Http(error.to_string())),
            Err(_) => Err(CairnError::Http(format!(
                "peer timed out: node={} after={:?}",
                node.node_id, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl BlobTransport for HttpTransport {
    async fn open_blob(&self, node: &StorageNode, oid: &str) -> Result<BlobStream> {
        let url = Self::parse(node.blob_url(oid))?;
        let response = self.send(self.client.get(url), node).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CairnError::BlobNotFound(oid.to_string()));
        }
        if !response.status().is_success() {
            return Err(CairnError::Http(format!(
                "blob fetch failed: node={} status={} oid={}",
                node.node_id,
                response.status(),
                oid
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CairnError::from))
            .boxed())
    }

    async fn delete_blob(&self, node: &StorageNode, oid: &str) -> Result<()> {
        let url = Self::parse(node.blob_url(oid))?;
        let request = self.client.delete(url).timeout(self.timeout);
        let response = self.send(request, node).await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(CairnError::Http(format!(
                "blob delete failed: node={} status={} oid={}",
                node.node_id, status, oid
            ))),
        }
    }

    async fn request_fetch(
        &self,
        node: &StorageNode,
        oid: &str,
        prev: Option<&str>,
    ) -> Result<()> {
        let url = Self::parse(node.fetch_url(oid))?;
        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(prev) = prev {
            request = request.header(PREV_NODE_HEADER, prev);
        }
        let response = self.send(request, node).await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(CairnError::Http(format!(
                "fetch request refused: node={} status={} oid={}",
                node.node_id,
                response.status(),
                oid
            )));
        }
        Ok(())
    }
}
