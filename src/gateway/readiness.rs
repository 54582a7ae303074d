use tokio::sync::watch;

use super::GatewayError;

/// Signalling half of the readiness latch. Dropping it without calling
/// [`ReadySignal::mark_ready`] releases every waiter with `NotReady`.
#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }
}

/// Waiting half, cloned into whoever needs the gateway.
#[derive(Debug, Clone)]
pub struct GatewayReadiness {
    rx: watch::Receiver<bool>,
}

impl GatewayReadiness {
    pub fn channel() -> (ReadySignal, GatewayReadiness) {
        let (tx, rx) = watch::channel(false);
        (ReadySignal { tx }, GatewayReadiness { rx })
    }

    /// A latch that is already open.
    pub fn ready() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the latch opens. Callers bound this with their own
    /// timeout.
    pub async fn wait_ready(&self) -> Result<(), GatewayError> {
        let mut rx = self.rx.clone();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_release_when_marked_ready() {
        let (signal, readiness) = GatewayReadiness::channel();
        assert!(!readiness.is_ready());

        let waiter = tokio::spawn({
            let readiness = readiness.clone();
            async move { readiness.wait_ready().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.mark_ready();

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn dropped_signal_fails_waiters() {
        let (signal, readiness) = GatewayReadiness::channel();
        drop(signal);
        assert_eq!(readiness.wait_ready().await, Err(GatewayError::NotReady));
    }

    #[tokio::test]
    async fn pre_opened_latch_ignores_dropped_sender() {
        let readiness = GatewayReadiness::ready();
        assert_eq!(readiness.wait_ready().await, Ok(()));
    }
}
