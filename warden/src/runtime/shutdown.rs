use std::sync::Arc;

use tokio::sync::watch;

/// Stop signal handed to every loop the runtime hosts: dispatchers,
/// consumers, coordinators and the metadata refresher.
///
/// Clones observe the same signal. Once stopped, a token stays stopped.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every loop to stop after its current cycle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called, including
    /// when it was called before this future was created.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once the
        // flag flips.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_every_loop() {
        let token = ShutdownToken::default();
        let loops: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move {
                    let mut cycles = 0u32;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return cycles,
                            _ = tokio::time::sleep(Duration::from_millis(5)) => cycles += 1,
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        for handle in loops {
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop ignored shutdown")
                .unwrap();
        }
        assert!(token.is_cancelled());
    }
}
