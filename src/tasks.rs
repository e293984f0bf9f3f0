/// Fire-and-forget offloading for long-running side effects (network sends,
/// file I/O) so the event-processing path never blocks on them. There is no
/// result channel on purpose; outcomes are observed through logs only.
pub fn submit<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::task::spawn_blocking(job);
}
