//! Readiness waiter
//!
//! 必须在启动服务进程之前 [`ReadinessWaiter::arm`]，否则可能错过通知。
//! 超时不是错误，返回 `None` 表示"未在时限内观察到"。

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::sandbox::{Sandbox, ServerReady};

pub struct ReadinessWaiter {
    rx: broadcast::Receiver<ServerReady>,
}

impl ReadinessWaiter {
    /// Subscribe to readiness notifications. Dropping the waiter unsubscribes.
    pub fn arm(sandbox: &dyn Sandbox) -> Self {
        Self {
            rx: sandbox.subscribe_ready(),
        }
    }

    /// Wait for the first notification or until `timeout` elapses.
    ///
    /// Consumes at most one notification and unsubscribes on return.
    pub async fn wait(mut self, timeout: Duration) -> Option<ServerReady> {
        let first = async {
            loop {
                match self.rx.recv().await {
                    Ok(ready) => return Some(ready),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Readiness receiver lagged");
                    }
                    // 发送端已关闭：不会再有通知，等到超时
                    Err(broadcast::error::RecvError::Closed) => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, first).await {
            Ok(ready) => {
                if let Some(ready) = &ready {
                    info!(port = ready.port, url = %ready.url, "Readiness observed");
                }
                ready
            }
            Err(_) => {
                info!(timeout_ms = timeout.as_millis() as u64, "Readiness not observed in time");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandbox;
    use std::time::Instant;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_times_out_without_notification() {
        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();
        let waiter = ReadinessWaiter::arm(&sandbox);
        let started = Instant::now();
        assert!(waiter.wait(Duration::from_millis(200)).await.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(190), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "returned late: {:?}", elapsed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_on_announcement() {
        use crate::sandbox::SpawnOptions;

        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();
        let waiter = ReadinessWaiter::arm(&sandbox);
        let args = vec![
            "-c".to_string(),
            "sleep 0.1; echo 'listening on http://127.0.0.1:5173'; sleep 1".to_string(),
        ];
        let _process = sandbox
            .spawn("sh", &args, &SpawnOptions::default())
            .await
            .unwrap();
        let ready = waiter.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ready.port, 5173);
        assert_eq!(ready.url, "http://127.0.0.1:5173/");
    }
}
