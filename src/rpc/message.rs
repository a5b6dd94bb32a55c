//! Typed request/response messages carried by the point-to-point transport
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request type and its associated response type. Each protocol is a serde
/// enum implementing this trait; dispatch on the receiving side is a match
/// over the variants.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
	type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Handler for a protocol's requests
#[async_trait]
pub trait EndpointHandler<M: Message>: Send + Sync {
	async fn handle(self: &Arc<Self>, msg: M, from: SocketAddr) -> M::Response;
}
