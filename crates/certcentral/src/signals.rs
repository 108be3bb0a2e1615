//! Signal handling.
//!
//! Bridges OS signals into the async runtime over a channel: SIGHUP asks
//! for a configuration reload, SIGTERM/SIGINT for graceful shutdown.

use std::sync::{mpsc, Arc, Mutex};

use tracing::{debug, trace};

/// What a signal asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Re-read configuration and reconcile records (SIGHUP).
    Reload,
    /// Stop admitting work and wind down (SIGTERM/SIGINT).
    Shutdown,
}

/// Receiver side of the signal bridge, usable from async code.
pub struct SignalBridge {
    rx: Arc<Mutex<mpsc::Receiver<SignalEvent>>>,
}

impl SignalBridge {
    /// Install handlers for SIGHUP/SIGTERM/SIGINT on a dedicated thread.
    pub fn install() -> std::io::Result<Self> {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let (tx, rx) = mpsc::channel();
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        std::thread::spawn(move || {
            for signal in signals.forever() {
                let event = match signal {
                    SIGHUP => SignalEvent::Reload,
                    SIGTERM | SIGINT => SignalEvent::Shutdown,
                    _ => continue,
                };
                debug!(signal, ?event, "signal received");
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(Self::from_receiver(rx))
    }

    fn from_receiver(rx: mpsc::Receiver<SignalEvent>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Wait for the next signal. `None` once the sender thread is gone.
    pub async fn recv(&self) -> Option<SignalEvent> {
        let rx = Arc::clone(&self.rx);
        trace!("waiting for signal");
        tokio::task::spawn_blocking(move || rx.lock().ok()?.recv().ok())
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_delivers_in_order() {
        let (tx, rx) = mpsc::channel();
        let bridge = SignalBridge::from_receiver(rx);

        tx.send(SignalEvent::Reload).unwrap();
        tx.send(SignalEvent::Shutdown).unwrap();

        assert_eq!(bridge.recv().await, Some(SignalEvent::Reload));
        assert_eq!(bridge.recv().await, Some(SignalEvent::Shutdown));
    }

    #[tokio::test]
    async fn test_recv_none_after_sender_dropped() {
        let (tx, rx) = mpsc::channel();
        let bridge = SignalBridge::from_receiver(rx);
        drop(tx);
        assert_eq!(bridge.recv().await, None);
    }
}
