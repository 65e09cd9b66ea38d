//! Timeout and fan-out race utilities shared by the protocol clients

use crate::types::MappingError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::debug;

/// Run a fallible future against a deadline
///
/// Resolves with the future's result, or [`MappingError::Timeout`] when the
/// deadline elapses first. The losing future is dropped, which releases any
/// socket or HTTP request it owned; a late response is never acted upon.
pub(crate) async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T, MappingError>
where
    F: Future<Output = Result<T, MappingError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MappingError::Timeout),
    }
}

/// Race a set of independent attempts and resolve on the first success
///
/// All attempts are spawned up front; the first `Ok` wins and the remaining
/// tasks are aborted when the [`JoinSet`] is dropped, closing their sockets.
/// Attempts that time out or fail are silent non-matches. When every attempt
/// fails the last protocol-level error is returned, or
/// [`MappingError::NoGateway`] if nothing answered at all.
pub(crate) async fn first_success<T, I, F>(attempts: I) -> Result<T, MappingError>
where
    T: Send + 'static,
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, MappingError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for attempt in attempts {
        set.spawn(attempt);
    }

    let mut last_error = MappingError::NoGateway;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(MappingError::Timeout)) => {}
            Ok(Err(e)) => {
                debug!("Gateway attempt failed: {}", e);
                last_error = e;
            }
            // Aborted or panicked attempt; treat like no response
            Err(_) => {}
        }
    }

    Err(last_error)
}
