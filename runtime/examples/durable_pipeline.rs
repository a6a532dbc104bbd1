//! Disk-backed stage with a flaky downstream.
//!
//! Every third delivery fails, so the same message comes back until it is
//! acknowledged. Stop with Ctrl+C and start again: undelivered messages are
//! recovered from the segment files.
//!
//! ```bash
//! cargo run -p varasto-runtime --example durable_pipeline
//! ```

use std::time::Duration;
use tokio::sync::mpsc;
use varasto_runtime::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    RuntimeBuilder::new()
        .buffer(BufferStrategy::mmap("./varasto_demo", 1024 * 1024))
        .shutdown_timeout(Duration::from_secs(10))
        .configure(|stage| async move {
            tracing::info!(backlog = stage.backlog(), "Recovered backlog");

            let (tx, rx) = mpsc::channel(1);
            let (resp_tx, resp_rx) = mpsc::channel(1);
            stage.start_receiving(rx)?;
            stage.start_listening(resp_rx)?;

            let mut outbound = stage
                .message_chan()
                .ok_or_else(|| anyhow::anyhow!("message channel already taken"))?;
            tokio::spawn(async move {
                let mut attempts = 0u64;
                while let Some(msg) = outbound.recv().await {
                    attempts += 1;
                    let response = if attempts % 3 == 0 {
                        Response::failure("downstream busy")
                    } else {
                        tracing::info!(parts = msg.len(), bytes = msg.payload_len(), "Delivered");
                        Response::Ack
                    };
                    if resp_tx.send(response).await.is_err() {
                        break;
                    }
                }
            });

            if let Some(mut upstream) = stage.response_chan() {
                tokio::spawn(async move { while upstream.recv().await.is_some() {} });
            }

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(250));
                for i in 0u64.. {
                    ticker.tick().await;
                    let msg = Message::new().with_part(Bytes::from(format!("event-{i}")));
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        })
        .await
}
