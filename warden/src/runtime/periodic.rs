use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use super::ShutdownToken;

/// Run `tick` immediately and then every `period` until shutdown. A tick
/// in flight is finished before the loop exits.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: ShutdownToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            tick().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        info!(task = name, "periodic task shutting down");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_periodic_ticks_until_shutdown() {
        let shutdown = ShutdownToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let handle = spawn_periodic("test", Duration::from_millis(5), shutdown.clone(), {
            let ticks = Arc::clone(&ticks);
            move || {
                let ticks = Arc::clone(&ticks);
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
