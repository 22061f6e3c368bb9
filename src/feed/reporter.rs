//! Error reporting channel
//!
//! Producers never wait on the logger: reports go through a bounded channel
//! with `try_send`, and a full buffer drops the report.

use crate::common::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle used by feed components to report errors
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<Error>,
}

/// Create a reporter and the receiving end for a single consumer
pub fn error_channel(capacity: usize) -> (ErrorReporter, mpsc::Receiver<Error>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorReporter { tx }, rx)
}

impl ErrorReporter {
    /// Report without blocking. Returns `false` if the report was dropped.
    pub fn report(&self, error: Error) -> bool {
        match self.tx.try_send(error) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(error)) => {
                tracing::warn!("Error channel full, dropping report: {}", error);
                false
            }
            Err(mpsc::error::TrySendError::Closed(error)) => {
                tracing::debug!("Error channel closed, dropping report: {}", error);
                false
            }
        }
    }
}

/// Log every reported error until all reporters are dropped
pub fn spawn_error_logger(mut rx: mpsc::Receiver<Error>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(error) = rx.recv().await {
            match &error {
                Error::FeedTerminated(component) => {
                    tracing::warn!("Feed exited: {}", component)
                }
                e if e.is_decode_error() => tracing::warn!("Dropped store event: {}", e),
                e => tracing::error!("Error: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (reporter, mut rx) = error_channel(2);
        assert!(reporter.report(Error::Transport("a".into())));
        assert!(reporter.report(Error::Transport("b".into())));
        assert!(!reporter.report(Error::Transport("c".into())));

        assert!(matches!(rx.recv().await, Some(Error::Transport(m)) if m == "a"));
        assert!(reporter.report(Error::Transport("d".into())));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (reporter, rx) = error_channel(1);
        drop(rx);
        assert!(!reporter.report(Error::FeedTerminated("change feed".into())));
    }

    #[tokio::test]
    async fn test_logger_exits_when_reporters_drop() {
        let (reporter, rx) = error_channel(4);
        let logger = spawn_error_logger(rx);
        reporter.report(Error::UnknownAction("get".into()));
        drop(reporter);
        logger.await.unwrap();
    }
}
