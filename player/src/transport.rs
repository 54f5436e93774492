//! Media stream transport.
//!
//! The broadcast is an unbounded chunked HTTP body. The session only needs
//! "give me the next chunk or tell me the stream ended", so that is the
//! whole trait; tests substitute scripted sources.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use tracing::{debug, info};

/// Source of raw media stream chunks.
#[async_trait]
pub trait ChunkSource: Send {
    /// Waits for the next chunk. `Ok(None)` means the stream ended cleanly.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Streaming HTTP GET source.
///
/// Chunks are handed downstream exactly as the transport delivers them;
/// chunk boundaries are whatever the server and HTTP stack produce.
pub struct HttpChunkSource {
    // ---
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    chunks_received: u64,
    bytes_received: u64,
}

impl HttpChunkSource {
    // ---
    /// Opens the broadcast URL and starts reading the chunked body.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server answers with an
    /// error status.
    pub async fn connect(client: &reqwest::Client, url: &str) -> Result<Self> {
        // ---
        info!("Connecting to media stream: {}", url);

        let response = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch media stream from {}", url))?
            .error_for_status()
            .context("media stream returned an error status")?;

        Ok(Self {
            stream: Box::pin(response.bytes_stream()),
            chunks_received: 0,
            bytes_received: 0,
        })
    }

    /// Returns (chunks_received, bytes_received).
    pub fn stats(&self) -> (u64, u64) {
        // ---
        (self.chunks_received, self.bytes_received)
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        // ---
        match self.stream.next().await {
            Some(Ok(chunk)) => {
                self.chunks_received += 1;
                self.bytes_received += chunk.len() as u64;

                if self.chunks_received % 100 == 0 {
                    debug!(
                        "Received {} chunks ({} bytes)",
                        self.chunks_received, self.bytes_received
                    );
                }

                Ok(Some(chunk))
            }
            Some(Err(e)) => Err(e).context("media stream read failed"),
            None => {
                info!("Media stream ended");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn from_chunks(chunks: Vec<reqwest::Result<Bytes>>) -> HttpChunkSource {
        // ---
        HttpChunkSource {
            stream: Box::pin(futures_util::stream::iter(chunks)),
            chunks_received: 0,
            bytes_received: 0,
        }
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_then_end() {
        // ---
        let mut source = from_chunks(vec![
            Ok(Bytes::from_static(b"first")),
            Ok(Bytes::from_static(b"second")),
        ]);

        assert_eq!(source.next_chunk().await.unwrap().unwrap(), "first");
        assert_eq!(source.next_chunk().await.unwrap().unwrap(), "second");
        assert!(source.next_chunk().await.unwrap().is_none());

        let (chunks, bytes) = source.stats();
        assert_eq!(chunks, 2);
        assert_eq!(bytes, 11);
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_end() {
        // ---
        let mut source = from_chunks(vec![]);
        assert!(source.next_chunk().await.unwrap().is_none());
        assert_eq!(source.stats(), (0, 0));
    }
}
