//! Periodic background tasks owned by the engine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::engine::CameraEngine;

/// Discards chunk transfers that outlived the chunk timeout.
pub(crate) async fn chunk_sweeper(
    engine: Arc<CameraEngine>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let sweep = AssertUnwindSafe(engine.expire_stale_transfers()).catch_unwind();
                match sweep.await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(expired = n, "chunk sweep finished"),
                    Err(_) => tracing::error!("chunk sweep panicked"),
                }
            }
        }
    }
    tracing::debug!("chunk sweeper stopped");
}

/// Sends at most one queued command per tick while a camera is connected.
pub(crate) async fn queue_drainer(
    engine: Arc<CameraEngine>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let step = AssertUnwindSafe(engine.drain_one_command()).catch_unwind();
                if step.await.is_err() {
                    tracing::error!("queue drain panicked");
                }
            }
        }
    }
    tracing::debug!("queue drainer stopped");
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::connection::{ConnId, Sender};
    use crate::engine::{EngineConfig, SubmitOutcome};
    use crate::handler::{Handler, Session};

    #[tokio::test]
    async fn sweepers_stop_on_cancel() {
        let engine = CameraEngine::new(EngineConfig::default());
        let cancel = CancellationToken::new();

        let a = tokio::spawn(chunk_sweeper(
            Arc::clone(&engine),
            Duration::from_secs(30),
            cancel.clone(),
        ));
        let b = tokio::spawn(queue_drainer(
            Arc::clone(&engine),
            Duration::from_millis(100),
            cancel.clone(),
        ));

        cancel.cancel();
        for handle in [a, b] {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("should stop")
                .expect("no panic");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drainer_sends_one_command_per_tick_in_priority_order() {
        let engine = CameraEngine::new(EngineConfig::default());
        engine.submit_command("flash", "10", None).await;
        engine.submit_command("resolution", "8", None).await;
        assert_eq!(
            engine.submit_command("reboot", "", None).await,
            SubmitOutcome::Enqueued
        );

        let peer = "10.0.0.2:5000".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut session = Session::new(peer, Sender::new(ConnId::from(peer), tx));
        engine
            .on_text(&mut session, r#"{"type":"register","device":"camera"}"#)
            .await;
        rx.try_recv().unwrap(); // register ack

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue_drainer(
            Arc::clone(&engine),
            Duration::from_millis(100),
            cancel.clone(),
        ));

        let mut order = Vec::new();
        for _ in 0..3 {
            let WsMessage::Text(t) = rx.recv().await.unwrap() else {
                panic!("expected text");
            };
            let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
            order.push(v["cmd"].as_str().unwrap().to_string());
        }
        assert_eq!(order, vec!["reboot", "resolution", "flash"]);
        assert_eq!(engine.pending_commands().await, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_sweeper_expires_after_timeout() {
        let engine = CameraEngine::new(EngineConfig::default());
        let peer = "10.0.0.2:5000".parse().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let mut session = Session::new(peer, Sender::new(ConnId::from(peer), tx));
        engine
            .on_text(&mut session, r#"{"type":"img_start","size":5000,"chunks":5}"#)
            .await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(chunk_sweeper(
            Arc::clone(&engine),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(engine.snapshot().await.frames_failed, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
