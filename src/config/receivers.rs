//! Fan-out of refreshed config to interested subsystems

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A subsystem that wants every refreshed config
#[async_trait]
pub trait ConfigReceiver<C>: Send + Sync {
    /// Name used in logs and failure reports
    fn name(&self) -> &str;

    /// Act on `config`; long-running work should watch `cancel`
    async fn run(&self, config: &C, cancel: &CancellationToken) -> Result<()>;
}

/// Adapts a synchronous closure into a receiver
pub struct ReceiverFn<F> {
    name: String,
    f: F,
}

impl<F> ReceiverFn<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<C, F> ConfigReceiver<C> for ReceiverFn<F>
where
    C: Send + Sync + 'static,
    F: Fn(&C) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, config: &C, _cancel: &CancellationToken) -> Result<()> {
        (self.f)(config)
    }
}

/// A receiver ran past its time limit
#[derive(Error, Debug)]
#[error("receiver {receiver} timed out after {after:?}")]
pub struct ReceiverTimedOut {
    pub receiver: String,
    pub after: Duration,
}

/// A receiver was abandoned because the caller cancelled
#[derive(Error, Debug)]
#[error("receiver {receiver} cancelled")]
pub struct ReceiverCancelled {
    pub receiver: String,
}

/// One receiver's failure
#[derive(Debug)]
pub struct ReceiverFailure {
    pub receiver: String,
    pub error: anyhow::Error,
}

/// Every failure from one fan-out, in registration order
#[derive(Error, Debug)]
pub struct ReceiverErrors {
    failures: Vec<ReceiverFailure>,
}

impl ReceiverErrors {
    pub fn failures(&self) -> &[ReceiverFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether any failure is, or was caused by, an `E`
    pub fn contains<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.find::<E>().is_some()
    }

    /// First failure that is, or was caused by, an `E`
    pub fn find<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.failures.iter().find_map(|failure| {
            failure
                .error
                .downcast_ref::<E>()
                .or_else(|| failure.error.chain().find_map(|cause| cause.downcast_ref::<E>()))
        })
    }
}

impl fmt::Display for ReceiverErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} receiver(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {:#}", sep, failure.receiver, failure.error)?;
        }
        Ok(())
    }
}

/// Run every receiver in order with the same config
///
/// A failing, stuck or cancelled receiver is recorded and the remaining
/// receivers still run.
pub async fn run_receivers<C: Sync>(
    receivers: &[Arc<dyn ConfigReceiver<C>>],
    config: &C,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), ReceiverErrors> {
    let mut failures = Vec::new();

    for receiver in receivers {
        let name = receiver.name();
        debug!("Running receiver {}", name);

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, receiver.run(config, cancel)) => match result {
                Ok(result) => result,
                Err(_) => Err(ReceiverTimedOut {
                    receiver: name.to_string(),
                    after: timeout,
                }
                .into()),
            },
            _ = cancel.cancelled() => Err(ReceiverCancelled {
                receiver: name.to_string(),
            }
            .into()),
        };

        if let Err(error) = outcome {
            warn!("Receiver {} failed: {:#}", name, error);
            failures.push(ReceiverFailure {
                receiver: name.to_string(),
                error,
            });
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ReceiverErrors { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Error, Debug)]
    #[error("first receiver broke")]
    struct FirstBroke;

    #[derive(Error, Debug)]
    #[error("second receiver broke: {0}")]
    struct SecondBroke(u32);

    #[derive(Error, Debug)]
    #[error("never raised")]
    struct NeverRaised;

    /// Blocks until cancelled, or forever
    struct StuckReceiver;

    #[async_trait]
    impl ConfigReceiver<u32> for StuckReceiver {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn run(&self, _config: &u32, _cancel: &CancellationToken) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn flagged(
        name: &str,
        flag: Arc<AtomicBool>,
        fail: Option<fn() -> anyhow::Error>,
    ) -> Arc<dyn ConfigReceiver<u32>> {
        Arc::new(ReceiverFn::new(name, move |_: &u32| {
            flag.store(true, Ordering::SeqCst);
            match fail {
                Some(make_error) => Err(make_error()),
                None => Ok(()),
            }
        }))
    }

    #[tokio::test]
    async fn test_failures_isolated_and_aggregated() {
        let flags: Vec<Arc<AtomicBool>> = (0..4).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let receivers = vec![
            flagged("ok1", flags[0].clone(), None),
            flagged("fail1", flags[1].clone(), Some(|| anyhow::Error::new(FirstBroke))),
            flagged("ok2", flags[2].clone(), None),
            flagged("fail2", flags[3].clone(), Some(|| anyhow::Error::new(SecondBroke(2)))),
        ];

        let errors = run_receivers(
            &receivers,
            &1,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        for flag in &flags {
            assert!(flag.load(Ordering::SeqCst));
        }
        assert_eq!(errors.len(), 2);
        assert!(errors.contains::<FirstBroke>());
        assert_eq!(errors.find::<SecondBroke>().map(|e| e.0), Some(2));
        assert!(!errors.contains::<NeverRaised>());

        let names: Vec<&str> = errors.failures().iter().map(|f| f.receiver.as_str()).collect();
        assert_eq!(names, vec!["fail1", "fail2"]);
        assert!(errors.to_string().starts_with("2 receiver(s) failed"));
    }

    #[tokio::test]
    async fn test_all_ok() {
        let flag = Arc::new(AtomicBool::new(false));
        let receivers = vec![flagged("ok", flag.clone(), None)];
        run_receivers(&receivers, &1, Duration::from_secs(5), &CancellationToken::new())
            .await
            .expect("no failures");
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_registration_order_and_shared_config() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let receivers: Vec<Arc<dyn ConfigReceiver<u32>>> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let seen = seen.clone();
                Arc::new(ReceiverFn::new(name, move |config: &u32| -> Result<()> {
                    seen.lock().expect("lock").push((name, *config));
                    Ok(())
                })) as Arc<dyn ConfigReceiver<u32>>
            })
            .collect();

        run_receivers(&receivers, &9, Duration::from_secs(5), &CancellationToken::new())
            .await
            .expect("no failures");

        assert_eq!(*seen.lock().expect("lock"), vec![("a", 9), ("b", 9), ("c", 9)]);
    }

    #[tokio::test]
    async fn test_wrapped_error_found_through_context() {
        let flag = Arc::new(AtomicBool::new(false));
        let receivers = vec![flagged(
            "wrapped",
            flag,
            Some(|| anyhow::Error::new(FirstBroke).context("applying flags")),
        )];

        let errors = run_receivers(&receivers, &1, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(errors.contains::<FirstBroke>());
    }

    #[tokio::test]
    async fn test_stuck_receiver_times_out() {
        let after = Arc::new(AtomicBool::new(false));
        let receivers: Vec<Arc<dyn ConfigReceiver<u32>>> =
            vec![Arc::new(StuckReceiver), flagged("after", after.clone(), None)];

        let errors = run_receivers(
            &receivers,
            &1,
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(after.load(Ordering::SeqCst));
        assert_eq!(errors.len(), 1);
        let timed_out = errors.find::<ReceiverTimedOut>().expect("timeout recorded");
        assert_eq!(timed_out.receiver, "stuck");
    }

    #[tokio::test]
    async fn test_cancel_releases_stuck_receiver() {
        let receivers: Vec<Arc<dyn ConfigReceiver<u32>>> = vec![Arc::new(StuckReceiver)];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let errors = tokio::time::timeout(
            Duration::from_secs(5),
            run_receivers(&receivers, &1, Duration::from_secs(600), &cancel),
        )
        .await
        .expect("fan-out did not return after cancel")
        .unwrap_err();

        assert!(errors.contains::<ReceiverCancelled>());
    }
}
