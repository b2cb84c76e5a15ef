//! Redis server for the pub/sub cache backend.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSubSink as RedisSink};
use tokio::sync::OnceCell;

use super::pubsub::{PubSubMessage, PubSubServer, PubSubSink};
use crate::error::BusError;

fn backend_error(err: redis::RedisError) -> BusError {
    BusError::Backend(err.to_string())
}

pub struct RedisPubSub {
    client: redis::Client,
    publisher: OnceCell<MultiplexedConnection>,
}

impl RedisPubSub {
    pub fn open(url: &str) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(url).map_err(backend_error)?,
            publisher: OnceCell::new(),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BusError> {
        self.publisher
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(backend_error)
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl PubSubServer for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut conn = self.publisher().await?;
        conn.publish(channel, payload.as_ref())
            .await
            .map_err(backend_error)
    }

    async fn connect(
        &self,
    ) -> Result<(Box<dyn PubSubSink>, BoxStream<'static, PubSubMessage>), BusError> {
        let pubsub = self.client.get_async_pubsub().await.map_err(backend_error)?;
        let (sink, stream) = pubsub.split();
        let stream = stream
            .map(|msg| PubSubMessage {
                channel: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })
            .boxed();
        Ok((Box::new(RedisPubSubSink { sink }), stream))
    }
}

struct RedisPubSubSink {
    sink: RedisSink,
}

#[async_trait]
impl PubSubSink for RedisPubSubSink {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BusError> {
        self.sink.subscribe(channel).await.map_err(backend_error)
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), BusError> {
        self.sink.unsubscribe(channel).await.map_err(backend_error)
    }
}
