//! Wires the relay engine to the image archive and runs until interrupted.

use std::sync::Arc;

use camrelay_image_store::ImageStore;
use camrelay_server::{CameraEngine, Frame, FrameHookError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Frames waiting for the disk writer. Newer frames are dropped when full.
const SAVE_QUEUE_SIZE: usize = 32;

/// Runs the relay until the server fails or SIGINT arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Image archive --
    let store = Arc::new(ImageStore::open(&config.images_dir, config.auto_save)?);
    let counts = store.saved_counts();
    tracing::info!(
        dirs = counts.total_dirs,
        images = counts.total_images,
        today = store.today_count(),
        "image archive scanned"
    );
    if let Some(last) = store.last_saved() {
        tracing::info!(path = %last.path, size = last.size, "last saved image");
    }

    // -- Engine --
    let engine = CameraEngine::new(config.engine_config());

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(SAVE_QUEUE_SIZE);
    if store.is_enabled() {
        engine.on_frame_accepted(move |frame| queue_frame(&frame_tx, frame));
    }

    let writer = tokio::spawn(save_frames(
        Arc::clone(&store),
        frame_rx,
        cancel.child_token(),
    ));

    // -- WS server --
    let server_engine = Arc::clone(&engine);
    let server_config = config.server_config();
    let mut server = tokio::spawn(async move { server_engine.run(server_config).await });

    tracing::info!(port = config.ws_port, "relay ready");

    tokio::select! {
        res = &mut server => {
            res??;
            tracing::info!("server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    // -- Graceful shutdown --
    engine.shutdown();
    if !server.is_finished() {
        if let Err(e) = server.await {
            tracing::warn!(error = %e, "server task failed during shutdown");
        }
    }
    cancel.cancel();
    writer.await?;

    Ok(())
}

/// Hands a frame to the disk writer. A full queue drops the frame.
fn queue_frame(tx: &mpsc::Sender<Frame>, frame: &Frame) -> Result<(), FrameHookError> {
    match tx.try_send(frame.clone()) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            tracing::debug!(size = frame.len(), "save queue full, frame not saved");
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err("frame writer has stopped".into()),
    }
}

/// Writes queued frames to disk off the async runtime.
async fn save_frames(
    store: Arc<ImageStore>,
    mut frames: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let store = Arc::clone(&store);
        let data = frame.bytes().clone();
        match tokio::task::spawn_blocking(move || store.save(&data)).await {
            Ok(Ok(Some(path))) => tracing::debug!(path = %path.display(), "frame saved"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "failed to save frame"),
            Err(e) => tracing::error!(error = %e, "frame writer panicked"),
        }
    }
    tracing::debug!("frame writer stopped");
}
