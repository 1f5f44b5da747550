//! Output aggregation: turns an instance's raw line stream into complete
//! replies.
//!
//! The chat process emits output with no end-of-message marker, so reply
//! completion is inferred from a quiet period: once the buffer is non-empty
//! and no line has arrived for the idle timeout, the buffered lines become
//! one complete reply. A reply is therefore never split across records
//! unless the child genuinely pauses mid-reply for longer than the
//! threshold.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info};

use super::instance::{CompleteReply, Instance, InstanceStatus};
use crate::error::InstanceError;
use crate::render;

/// Runs for the lifetime of one running instance; exits as soon as the
/// instance leaves `Running`.
pub(crate) async fn run(
    instance: Arc<Instance>,
    mut lines: mpsc::UnboundedReceiver<String>,
    idle_timeout: Duration,
    poll_interval: Duration,
) {
    let mut buffer: Vec<String> = Vec::new();
    let mut last_line_at = Instant::now();

    info!(instance = %instance.id(), "output monitor started");

    loop {
        if instance.status().await != InstanceStatus::Running {
            break;
        }

        match timeout(poll_interval, lines.recv()).await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    buffer.push(line.to_string());
                    last_line_at = Instant::now();
                    instance.touch().await;
                }
            }
            Ok(None) => {
                // The child closed its output pipes. Flush whatever was
                // buffered, then record the fault unless this was a
                // deliberate stop.
                if !buffer.is_empty() {
                    flush(&instance, &mut buffer).await;
                }
                if instance.status().await == InstanceStatus::Running {
                    let fault = InstanceError::MonitorFailure {
                        id: instance.id().to_string(),
                        reason: "output stream closed".to_string(),
                    };
                    error!(instance = %instance.id(), "{fault}");
                    instance
                        .set_status(InstanceStatus::Error, fault.to_string())
                        .await;
                }
                break;
            }
            Err(_) => {
                if !buffer.is_empty() && last_line_at.elapsed() > idle_timeout {
                    flush(&instance, &mut buffer).await;
                }
            }
        }
    }

    debug!(instance = %instance.id(), "output monitor stopped");
}

async fn flush(instance: &Arc<Instance>, buffer: &mut Vec<String>) {
    let raw = buffer.join("\n");
    let content = render::format_markdown(&raw);
    debug!(instance = %instance.id(), lines = buffer.len(), "reply complete");
    instance.output().push(CompleteReply::new(raw, content)).await;
    buffer.clear();
}
