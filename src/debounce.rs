//! Temporizador de "debounce" con una única plaza pendiente.
//!
//! Cada `schedule` cancela la tarea pendiente anterior y programa la nueva
//! tras el periodo de silencio. Una vez vencido el temporizador la tarea
//! se ejecuta hasta el final; descartar su resultado si ya no vale es
//! responsabilidad de quien la programa.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn schedule<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self.slot().replace(token.clone()) {
            previous.cancel();
        }

        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => job.await,
            }
        });
    }

    /// Cancela la tarea pendiente, si la hay.
    pub fn cancel(&self) {
        if let Some(token) = self.slot().take() {
            token.cancel();
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, text: &str) -> impl Future<Output = ()> + Send + 'static {
        let log = log.clone();
        let text = text.to_string();
        async move {
            log.lock().unwrap().push(text);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_last_of_a_burst_runs() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let log = Log::default();

        debouncer.schedule(push(&log, "a"));
        sleep(Duration::from_millis(100)).await;
        debouncer.schedule(push(&log, "ab"));
        sleep(Duration::from_millis(100)).await;
        debouncer.schedule(push(&log, "abc"));
        sleep(Duration::from_millis(499)).await;
        assert!(log.lock().unwrap().is_empty());

        sleep(Duration::from_millis(10)).await;
        assert_eq!(*log.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_out_changes_each_run() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let log = Log::default();

        debouncer.schedule(push(&log, "a"));
        sleep(Duration::from_millis(600)).await;
        debouncer.schedule(push(&log, "ab"));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "ab".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_the_pending_job() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let log = Log::default();

        debouncer.schedule(push(&log, "a"));
        sleep(Duration::from_millis(200)).await;
        debouncer.cancel();
        sleep(Duration::from_secs(2)).await;
        assert!(log.lock().unwrap().is_empty());
    }
}
