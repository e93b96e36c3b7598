//! The tee pipeline.
//!
//! A NAR fetched from an upstream is consumed twice: once by local
//! storage and once by the client that triggered the fetch. The pump
//! splits the upstream byte stream into two bounded chunk channels:
//!
//! - The storage sink is authoritative. Its back-pressure throttles
//!   the pump, and a storage failure aborts the transfer.
//! - The client sink is best-effort. A dropped receiver (the client
//!   went away) detaches the client and the pump keeps feeding
//!   storage to completion.
//!
//! A slower consumer stalls the faster one only once its channel
//! buffer is full.

use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Chunks buffered per sink before back-pressure applies.
pub const CHANNEL_CAPACITY: usize = 64;

pub type ChunkSender = mpsc::Sender<io::Result<Bytes>>;
pub type ChunkReceiver = mpsc::Receiver<io::Result<Bytes>>;

/// Creates the chunk channel bridging one tee sink.
pub fn channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Adapts a chunk receiver into an `AsyncRead`.
pub fn reader(receiver: ChunkReceiver) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(receiver_stream(receiver))
}

fn receiver_stream(
    mut receiver: ChunkReceiver,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
    Box::pin(async_stream::stream! {
        while let Some(item) = receiver.recv().await {
            yield item;
        }
    })
}

/// Pumps an upstream byte stream into both sinks.
///
/// Returns the number of bytes transferred. Errors from the upstream
/// stream are forwarded to both sinks before being returned.
pub async fn pump<S, E>(
    mut upstream: S,
    store: ChunkSender,
    client: ChunkSender,
) -> io::Result<u64>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut transferred = 0u64;
    let mut client = Some(client);

    while let Some(chunk) = upstream.next().await {
        match chunk {
            Ok(bytes) => {
                transferred += bytes.len() as u64;

                if let Some(tx) = &client {
                    if tx.send(Ok(bytes.clone())).await.is_err() {
                        // client went away; keep persisting
                        client = None;
                    }
                }

                if store.send(Ok(bytes)).await.is_err() {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "storage sink closed",
                    ));
                }
            }
            Err(e) => {
                let message = e.to_string();

                if let Some(tx) = &client {
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::Other, message.clone())))
                        .await;
                }
                let _ = store
                    .send(Err(io::Error::new(io::ErrorKind::Other, message)))
                    .await;

                return Err(io::Error::new(io::ErrorKind::Other, e));
            }
        }
    }

    Ok(transferred)
}
