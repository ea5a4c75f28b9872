use crate::error::{LabError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Run `op` for every item with at most `concurrency` in flight (`0` means
/// no limit). Items are `(host key, payload)`; the key only labels logs.
///
/// Fail-fast: the first error aborts every task still running or waiting
/// for a permit and becomes the result. Every failure observed before the
/// abort lands is logged.
pub async fn fan_out<T, F, Fut>(
    label: &str,
    items: Vec<(String, T)>,
    concurrency: usize,
    op: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let limit = match concurrency {
        0 => None,
        n => Some(Arc::new(Semaphore::new(n))),
    };
    debug!(label, items = items.len(), concurrency, "fan-out");

    let mut set = JoinSet::new();
    for (key, item) in items {
        let fut = op(item);
        let limit = limit.clone();
        set.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it is.
            let _permit = match limit {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            (key, fut.await)
        });
    }

    let mut first: Option<LabError> = None;
    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((key, Err(e))) => {
                error!(label, host = %key, error = %e, "host operation failed");
                e
            }
            Err(e) if e.is_cancelled() => continue,
            Err(e) => {
                error!(label, error = %e, "host task panicked");
                LabError::Transport {
                    host: "unknown".into(),
                    reason: format!("{label} task panicked: {e}"),
                }
            }
        };
        if first.is_none() {
            first = Some(failure);
            set.abort_all();
        }
    }

    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn items(n: usize) -> Vec<(String, usize)> {
        (0..n).map(|i| (format!("r/h{i}"), i)).collect()
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        fan_out("stop", items(40), 15, |_| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 15, "peak {peak}");
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn first_failure_cancels_the_rest() {
        let finished = Arc::new(AtomicUsize::new(0));
        let err = fan_out("start", items(20), 2, |i| {
            let finished = finished.clone();
            async move {
                if i == 0 {
                    return Err(LabError::Transport {
                        host: "r/h0".into(),
                        reason: "boom".into(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(finished.load(Ordering::SeqCst) < 19);
    }

    #[tokio::test]
    async fn cancelled_host_command_is_killed() {
        use crate::model::Model;
        use crate::selector::Selector;
        use crate::topology::{Host, Region};
        use crate::transport::{LocalTransport, Transport};

        let dir = tempfile::TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new(dir.path()));
        let model = Model::builder("lab")
            .region(Region::new("r").host(Host::new("a")).host(Host::new("b")))
            .build()
            .unwrap();
        let hosts: Vec<_> = model
            .selected_views(&Selector::All)
            .into_iter()
            .map(|v| (v.key.clone(), v))
            .collect();

        let err = fan_out("exec", hosts, 0, |host| {
            let transport = transport.clone();
            async move {
                let command = if host.id == "a" { "exit 3" } else { "sleep 1; touch marker" };
                let out = transport.exec(&host, command).await?;
                if out.status != 0 {
                    return Err(LabError::Transport {
                        host: host.key.clone(),
                        reason: format!("exit {}", out.status),
                    });
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exit 3"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("r/b/marker").exists());
    }

    #[tokio::test]
    async fn zero_means_unbounded_and_empty_is_ok() {
        fan_out("noop", Vec::<(String, ())>::new(), 0, |_| async { Ok(()) })
            .await
            .unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        fan_out("all", items(10), 0, |_| {
            let done = done.clone();
            async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }
}
