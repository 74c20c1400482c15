use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{PulseError, PulseResult};

/// Runs `fut` under a deadline. The deadline fires even when the transport
/// underneath never returns.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> PulseResult<T>
where
    F: Future<Output = PulseResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(outcome) => outcome,
        Err(_) => Err(PulseError::Timeout(limit.as_millis() as u64)),
    }
}

/// Polls every branch concurrently and resolves with the first `Ok`.
/// Remaining branches are dropped. When all branches fail, every branch's
/// error is returned in completion order.
pub async fn first_success<T, F, I>(branches: I, per_branch: Duration) -> Result<T, Vec<PulseError>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = PulseResult<T>>,
{
    let mut pending: FuturesUnordered<_> = branches
        .into_iter()
        .map(|branch| with_timeout(per_branch, branch))
        .collect();

    let mut errors = Vec::new();
    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => errors.push(err),
        }
    }
    Err(errors)
}

/// Waits for every branch and returns each outcome in input order. A failing
/// branch never affects its siblings.
pub async fn best_effort_all<T, F, I>(branches: I, per_branch: Duration) -> Vec<PulseResult<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = PulseResult<T>>,
{
    join_all(branches.into_iter().map(|branch| with_timeout(per_branch, branch))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    fn after(ms: u64, outcome: PulseResult<u32>) -> BoxFuture<'static, PulseResult<u32>> {
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            outcome
        }
        .boxed()
    }

    #[tokio::test]
    async fn first_success_skips_failures() {
        let branches = vec![
            after(1, Err(PulseError::Malformed("a".into()))),
            after(20, Ok(2)),
            after(200, Ok(3)),
        ];
        assert_eq!(first_success(branches, Duration::from_secs(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn first_success_reports_every_failure() {
        let branches = vec![
            after(1, Err(PulseError::Malformed("a".into()))),
            after(500, Ok(9)),
            after(2, Err(PulseError::Status(502))),
        ];
        let errors = first_success(branches, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[2], PulseError::Timeout(50)));
    }

    #[tokio::test]
    async fn best_effort_keeps_partial_results() {
        let branches = vec![after(1, Ok(1)), after(1, Err(PulseError::Status(500))), after(300, Ok(3))];
        let outcomes = best_effort_all(branches, Duration::from_millis(100)).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(*outcomes[0].as_ref().unwrap(), 1);
        assert!(outcomes[1].is_err());
        assert!(matches!(outcomes[2], Err(PulseError::Timeout(_))));
    }
}
