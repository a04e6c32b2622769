//! Generation gateway
//!
//! The only way into the model. Requests queue on a fair (FIFO) mutex, the
//! winner's guard moves onto a blocking thread together with the work, and the
//! lock is released when that thread is done with the model, whatever the
//! outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::{Error, GeneratedImage, GenerationRequest, GenerationResult, ImageModel, Result};

type SharedModel = Arc<Mutex<Box<dyn ImageModel>>>;

#[derive(Clone)]
pub struct Gateway {
    model: SharedModel,
    model_name: String,
    waiting: Arc<AtomicUsize>,
    max_pixels: u64,
    queue_timeout: Duration,
    generation_timeout: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("model", &self.model_name)
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Decrements the waiting count when a caller leaves the queue, however it leaves.
struct QueueTicket(Arc<AtomicUsize>);

impl QueueTicket {
    fn take(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Gateway {
    pub fn new(model: Box<dyn ImageModel>, limits: &LimitsConfig) -> Self {
        let model_name = model.name().to_string();
        Self {
            model: Arc::new(Mutex::new(model)),
            model_name,
            waiting: Arc::new(AtomicUsize::new(0)),
            max_pixels: limits.max_pixels,
            queue_timeout: limits.queue_timeout(),
            generation_timeout: limits.generation_timeout(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Callers currently queued or running.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Runs `request.count` generations, seeds `base, base + 1, ...`.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        request.validate(self.max_pixels)?;
        let base_seed = request.seed.unwrap_or_else(rand::random);

        let ticket = QueueTicket::take(&self.waiting);
        let ahead = self.waiting().saturating_sub(1);
        if ahead > 0 {
            debug!("request from {} queued behind {}", request.requester, ahead);
        }

        let guard = tokio::time::timeout(self.queue_timeout, self.model.clone().lock_owned())
            .await
            .map_err(|_| {
                warn!("request from {} timed out in queue", request.requester);
                Error::QueueTimeout(self.queue_timeout)
            })?;

        info!(
            "generating {} image(s) {}x{} for {} (seed {}, {} steps): {:?}",
            request.count,
            request.width,
            request.height,
            request.requester,
            base_seed,
            request.steps,
            request.prompt
        );

        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || {
            let _ticket = ticket;
            let mut model = guard;
            (0..u64::from(request.count))
                .map(|i| {
                    let seed = base_seed.wrapping_add(i);
                    model
                        .generate(&request, seed)
                        .map(|image| GeneratedImage { image, seed })
                })
                .collect::<anyhow::Result<Vec<_>>>()
        });

        let images = match tokio::time::timeout(self.generation_timeout, task).await {
            Err(_) => {
                warn!("generation exceeded {:?}", self.generation_timeout);
                return Err(Error::Timeout(self.generation_timeout));
            }
            Ok(Err(join_err)) => {
                return Err(Error::ModelUnavailable(format!(
                    "generation task failed: {join_err}"
                )))
            }
            Ok(Ok(result)) => result.map_err(Error::from_model)?,
        };

        let elapsed = started.elapsed();
        info!("generated {} image(s) in {:.1?}", images.len(), elapsed);
        Ok(GenerationResult { images, elapsed })
    }
}
