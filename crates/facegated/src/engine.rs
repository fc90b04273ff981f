use crate::gate::FaceAnalyzer;
use facegate_core::{BackendError, Embedding, ExtractionError, FaceEmbedder, FacePresence, OnnxEmbedder, QuickDetector};
use facegate_models::ModelSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

type Reply<T> = oneshot::Sender<Result<T, ExtractionError>>;

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract { image: Vec<u8>, reply: Reply<Embedding> },
    HasFace { image: Vec<u8>, reply: Reply<bool> },
}

impl EngineRequest {
    /// The caller timed out or went away; nobody will read the reply.
    fn abandoned(&self) -> bool {
        match self {
            Self::Extract { reply, .. } => reply.is_closed(),
            Self::HasFace { reply, .. } => reply.is_closed(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Extract { .. } => "extract",
            Self::HasFace { .. } => "has_face",
        }
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
    model_version: Arc<str>,
}

impl EngineHandle {
    /// Decode, detect and embed the strongest face in `image`.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, ExtractionError> {
        self.request(|reply| EngineRequest::Extract { image, reply }).await
    }

    /// Quick presence check; does not run the recognizer.
    pub async fn has_face(&self, image: Vec<u8>) -> Result<bool, ExtractionError> {
        self.request(|reply| EngineRequest::HasFace { image, reply }).await
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, ExtractionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(build(reply_tx))
                .await
                .map_err(|_| closed())?;
            reply_rx.await.map_err(|_| closed())?
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs_f32(), "engine request timed out");
                Err(ExtractionError::ExtractionFailure(format!(
                    "extraction timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

impl FaceAnalyzer for EngineHandle {
    async fn extract(&self, image: Vec<u8>) -> Result<Embedding, ExtractionError> {
        EngineHandle::extract(self, image).await
    }

    async fn has_face(&self, image: Vec<u8>) -> Result<bool, ExtractionError> {
        EngineHandle::has_face(self, image).await
    }
}

fn closed() -> ExtractionError {
    ExtractionError::ExtractionFailure("engine thread exited".into())
}

/// Load the ONNX models and spawn the engine on a dedicated OS thread.
///
/// Fails fast at startup if any model cannot be loaded.
pub fn spawn_engine(models: &ModelSet, timeout: Duration) -> Result<EngineHandle, EngineError> {
    let embedder = OnnxEmbedder::load(&models.detector, &models.recognizer)?;
    tracing::info!(
        detector = %models.detector.display(),
        recognizer = %models.recognizer.display(),
        model_version = embedder.model_version(),
        "embedding models loaded"
    );

    let quick = QuickDetector::load(&models.quick_detector).map_err(BackendError::from)?;
    tracing::info!(path = %models.quick_detector.display(), "quick detector loaded");

    let model_version = embedder.model_version().to_string();
    spawn(embedder, quick, model_version, timeout)
}

/// Run `embedder` and `presence` on their own thread, serving requests in order.
///
/// Inference sessions are not shared; the thread owns both backends for its lifetime.
pub fn spawn<E, P>(
    mut embedder: E,
    mut presence: P,
    model_version: String,
    timeout: Duration,
) -> Result<EngineHandle, EngineError>
where
    E: FaceEmbedder + Send + 'static,
    P: FacePresence + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.abandoned() {
                    tracing::debug!(kind = req.kind(), "skipping request abandoned by caller");
                    continue;
                }
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let result = facegate_core::extract(&mut embedder, &image);
                        if let Err(e) = &result {
                            tracing::debug!(error = %e, bytes = image.len(), "extract rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::HasFace { image, reply } => {
                        let _ = reply.send(facegate_core::has_face(&mut presence, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle {
        tx,
        timeout,
        model_version: model_version.into(),
    })
}
