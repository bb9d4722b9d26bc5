//! Fire-and-forget audit logging.
//!
//! Entries go onto an unbounded queue drained by a single worker task. Callers
//! never wait on, or fail because of, the audit sink: a failed append is logged
//! and counted, then dropped.

use crate::providers::AuditSink;
use crate::state::AuditLogEntry;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum AuditCommand {
    Append(Box<AuditLogEntry>),
    Flush(oneshot::Sender<()>),
}

/// Handle for submitting audit entries.
///
/// Cheap to clone; the worker stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl std::fmt::Debug for AuditCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Append(entry) => f.debug_tuple("Append").field(&entry.id).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl AuditLogger {
    /// Start the worker draining into `sink`.
    ///
    /// Each append carries `timeout`, so a stalled sink delays only the queue.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn<S>(sink: S, timeout: std::time::Duration) -> (Self, JoinHandle<()>)
    where
        S: AuditSink + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(sink, rx, timeout));
        (Self { tx }, worker)
    }

    /// Queue an entry. Never blocks and never fails.
    pub fn record(&self, entry: AuditLogEntry) {
        let action = entry.action.as_str();
        if self.tx.send(AuditCommand::Append(Box::new(entry))).is_err() {
            metrics::counter!("audit.failed").increment(1);
            tracing::warn!(action, "Audit worker stopped, entry dropped");
        }
    }

    /// Wait until every entry queued before this call has been handled.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn drain<S: AuditSink>(
    sink: S,
    mut rx: mpsc::UnboundedReceiver<AuditCommand>,
    timeout: std::time::Duration,
) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Append(entry) => {
                let result =
                    crate::deadline::with_deadline("audit.append", timeout, sink.append(&entry))
                        .await;
                if let Err(err) = result {
                    metrics::counter!("audit.failed").increment(1);
                    tracing::warn!(
                        action = entry.action.as_str(),
                        status = entry.status.as_str(),
                        error = %err.detail(),
                        "Audit append failed"
                    );
                }
            }
            AuditCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!("Audit worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SharedClock};
    use crate::mocks::{ManualClock, MockDurableStore};
    use crate::providers::AuditSink;
    use crate::state::{AuditAction, AuditContext, AuditStatus};
    use std::sync::Arc;

    fn entry(clock: &ManualClock, status: AuditStatus) -> AuditLogEntry {
        AuditLogEntry::new(
            AuditContext::for_ref("tg:42"),
            AuditAction::StartLink,
            status,
            clock.now(),
        )
    }

    #[tokio::test]
    async fn test_entries_reach_sink_in_order() {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let sink = MockDurableStore::new(shared);
        let (logger, _worker) = AuditLogger::spawn(sink.clone(), std::time::Duration::from_secs(1));

        logger.record(entry(&clock, AuditStatus::Failed));
        clock.advance(chrono::Duration::seconds(1));
        logger.record(entry(&clock, AuditStatus::Success));
        logger.flush().await;

        let page = sink.page("tg:42", 10, 0).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.entries[0].status, AuditStatus::Success);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let sink = MockDurableStore::new(shared);
        sink.failures().fail_all(true);
        let (logger, _worker) = AuditLogger::spawn(sink.clone(), std::time::Duration::from_secs(1));

        logger.record(entry(&clock, AuditStatus::Success));
        logger.flush().await;

        sink.failures().fail_all(false);
        assert_eq!(sink.page("tg:42", 10, 0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_drop() {
        let shared: SharedClock = Arc::new(ManualClock::default());
        let (logger, worker) =
            AuditLogger::spawn(MockDurableStore::new(shared), std::time::Duration::from_secs(1));

        drop(logger);
        worker.await.unwrap();
    }
}
