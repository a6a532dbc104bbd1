//! Minimal varasto stage - prints every message and acknowledges it.
//!
//! ```bash
//! cargo run -p varasto-runtime --example echo_pipeline
//! ```

use tokio::sync::mpsc;
use varasto_runtime::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    varasto_runtime::run(|stage| async move {
        let (tx, rx) = mpsc::channel(1);
        let (resp_tx, resp_rx) = mpsc::channel(1);
        stage.start_receiving(rx)?;
        stage.start_listening(resp_rx)?;

        let mut outbound = stage
            .message_chan()
            .ok_or_else(|| anyhow::anyhow!("message channel already taken"))?;
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let parts: Vec<String> = msg
                    .parts()
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect();
                println!("{}", parts.join(" | "));
                if resp_tx.send(Response::Ack).await.is_err() {
                    break;
                }
            }
        });

        if let Some(mut upstream) = stage.response_chan() {
            tokio::spawn(async move { while upstream.recv().await.is_some() {} });
        }

        tokio::spawn(async move {
            for i in 0..10 {
                let msg = Message::from_slices(["hello".to_string(), format!("#{i}")]);
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    })
    .await
}
