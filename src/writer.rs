use crate::db::SampleStore;
use crate::errors::{AppError, AppResult};
use crate::models::{HealthSample, MetricsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const WRITER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    pub write_attempts: u32,
    pub retry_delay: Duration,
    pub failure_threshold: u32,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            retry_delay: Duration::from_millis(250),
            failure_threshold: 5,
        }
    }
}

struct AppendRequest {
    sample: HealthSample,
    metrics: Option<MetricsSnapshot>,
    reply: oneshot::Sender<AppResult<HealthSample>>,
}

/// Single logical writer in front of the store. Appends from any number of
/// check tasks are queued and applied one at a time.
#[derive(Clone)]
pub struct SampleWriter {
    sender: mpsc::Sender<AppendRequest>,
}

impl SampleWriter {
    /// The writer task ends once every clone of the returned handle is dropped.
    pub fn spawn(store: Arc<dyn SampleStore>, settings: WriterSettings) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel::<AppendRequest>(WRITER_QUEUE_DEPTH);
        let task = tokio::spawn(writer_loop(store, settings, receiver));
        (Self { sender }, task)
    }

    pub async fn append(
        &self,
        sample: HealthSample,
        metrics: Option<MetricsSnapshot>,
    ) -> AppResult<HealthSample> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(AppendRequest { sample, metrics, reply })
            .await
            .map_err(|_| AppError::StoreUnavailable("sample writer has stopped".to_string()))?;
        response
            .await
            .map_err(|_| {
                AppError::StoreUnavailable("sample writer dropped the request".to_string())
            })?
    }
}

async fn writer_loop(
    store: Arc<dyn SampleStore>,
    settings: WriterSettings,
    mut receiver: mpsc::Receiver<AppendRequest>,
) {
    let mut consecutive_failures = 0u32;
    while let Some(request) = receiver.recv().await {
        let result = if consecutive_failures >= settings.failure_threshold {
            Err(AppError::StoreUnavailable(format!(
                "{} consecutive writes failed",
                consecutive_failures
            )))
        } else {
            match write_with_retry(store.as_ref(), &request, &settings).await {
                Ok(stored) => {
                    consecutive_failures = 0;
                    Ok(stored)
                }
                Err(error) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= settings.failure_threshold {
                        tracing::error!(
                            failures = consecutive_failures,
                            error = %error,
                            "sample store unavailable"
                        );
                        Err(AppError::StoreUnavailable(error.to_string()))
                    } else {
                        Err(error)
                    }
                }
            }
        };
        let _ = request.reply.send(result);
    }
    tracing::debug!("sample writer drained");
}

async fn write_with_retry(
    store: &dyn SampleStore,
    request: &AppendRequest,
    settings: &WriterSettings,
) -> AppResult<HealthSample> {
    let attempts = settings.write_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match store.append_sample(&request.sample, request.metrics.as_ref()) {
            Ok(stored) => return Ok(stored),
            Err(error) => {
                tracing::warn!(
                    target_id = %request.sample.target_id,
                    attempt,
                    error = %error,
                    "sample append failed"
                );
                last_error = error.to_string();
                if attempt < attempts {
                    tokio::time::sleep(settings.retry_delay).await;
                }
            }
        }
    }
    Err(AppError::StoreWrite(format!(
        "target {}: {} (after {} attempts)",
        request.sample.target_id, last_error, attempts
    )))
}
