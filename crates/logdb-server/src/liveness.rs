//! Liveness channel between a worker process and the supervisor
//!
//! A worker proves forward progress by writing a single byte to its stdout.
//! The supervisor owns the read end of that pipe. Content is irrelevant;
//! only whether anything arrived since the last drain matters.

use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Token written per progress event
pub const TICK: &[u8] = b".";

/// Emits progress signals from inside a worker.
pub trait Liveness: Send + Sync {
    fn tick(&self);
}

impl<L: Liveness + ?Sized> Liveness for Arc<L> {
    fn tick(&self) {
        (**self).tick()
    }
}

/// Writes [`TICK`] to stdout, the pipe the supervisor reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutLiveness;

impl Liveness for StdoutLiveness {
    fn tick(&self) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(TICK).and_then(|()| out.flush()) {
            // A closed pipe means the supervisor is gone; keep working.
            warn!(error = %e, "Failed to write liveness tick");
        }
    }
}

/// For workers run by hand, outside a supervisor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLiveness;

impl Liveness for NoopLiveness {
    fn tick(&self) {}
}

/// Supervisor end of one worker's liveness pipe.
///
/// Created fresh for every launch and dropped with it; handles are never
/// carried over to a replacement process.
pub struct LivenessReceiver {
    signals: mpsc::UnboundedReceiver<()>,
    reader: JoinHandle<()>,
}

impl LivenessReceiver {
    pub fn attach<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (sender, signals) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!(bytes = n, "Liveness signal");
                        if sender.send(()).is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Liveness pipe read failed");
                        break;
                    },
                }
            }
        });

        Self { signals, reader }
    }

    /// Consume every pending signal. Returns whether there was at least one;
    /// any number of ticks counts as a single liveness event.
    pub fn drain(&mut self) -> bool {
        let mut seen = false;
        while self.signals.try_recv().is_ok() {
            seen = true;
        }
        seen
    }
}

impl Drop for LivenessReceiver {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
