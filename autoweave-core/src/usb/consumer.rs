//! Stream consumer: tails the durable stream and feeds the plugin manager.
//!
//! Publishing and dispatch are decoupled through the stream, so a consumer
//! restart resumes from its cursor and delivery to plugins is at-least-once
//! (duplicates possible after a crash between dispatch and cursor
//! advance).

use std::time::Duration;

use autoweave_model::StreamEvent;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::plugins::manager::PluginManagerHandle;

const BLOCK_MS: usize = 1_000;
const READ_COUNT: usize = 100;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tails one stream from `$` (only events after startup) and dispatches
/// each record to the plugin manager.
pub struct StreamConsumer {
    conn: ConnectionManager,
    stream: String,
    manager: PluginManagerHandle,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("stream", &self.stream)
            .finish()
    }
}

impl StreamConsumer {
    pub async fn connect(
        url: &str,
        stream: impl Into<String>,
        manager: PluginManagerHandle,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            stream: stream.into(),
            manager,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(stream = self.stream, "stream consumer started");
        let mut cursor = "$".to_string();
        let options = StreamReadOptions::default()
            .block(BLOCK_MS)
            .count(READ_COUNT);

        loop {
            let reply: Result<StreamReadReply, _> = self
                .conn
                .xread_options(&[&self.stream], &[&cursor], &options)
                .await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, "stream read failed, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            for key in reply.keys {
                for entry in key.ids {
                    cursor = entry.id.clone();
                    let fields: Vec<(String, String)> = entry
                        .map
                        .iter()
                        .filter_map(|(field, value)| {
                            redis::from_redis_value::<String>(value.clone())
                                .ok()
                                .map(|value| (field.clone(), value))
                        })
                        .collect();
                    let borrowed: Vec<(&str, &str)> = fields
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .collect();
                    match StreamEvent::from_fields(borrowed) {
                        Ok(event) => {
                            debug!(
                                id = entry.id,
                                signature = %event.device_signature,
                                "stream record consumed"
                            );
                            self.manager.dispatch_stream_event(event).await;
                        }
                        Err(err) => {
                            warn!(
                                id = entry.id,
                                error = %err,
                                "skipping malformed stream record"
                            );
                        }
                    }
                }
            }
        }
    }
}
