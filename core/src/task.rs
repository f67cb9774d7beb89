use std::future::Future;

/// Spawn a background task. Batching ticks, cache revalidation, and optimistic
/// timeouts all go through here.
pub fn spawn<F>(future: F)
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    tokio::spawn(future);
}
