//! Worker pool that runs blocking API calls off the caller's thread and
//! reports each result exactly once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, warn};

use crate::error::ApiError;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

pub struct Dispatcher {
    jobs: Sender<Task>,
    stop: Sender<()>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(cfg: Config) -> Self {
        let workers = if cfg.workers == 0 { 2 } else { cfg.workers };
        let (job_tx, job_rx) = unbounded::<Task>();
        let (stop_tx, stop_rx) = unbounded::<()>();

        let handles = (0..workers)
            .map(|idx| {
                let jobs = job_rx.clone();
                let stop = stop_rx.clone();
                thread::Builder::new()
                    .name(format!("redlurk-worker-{idx}"))
                    .spawn(move || worker(idx, jobs, stop))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!("dispatch: failed to start worker: {err}");
                    None
                }
            })
            .collect();

        Self {
            jobs: job_tx,
            stop: stop_tx,
            handles,
        }
    }

    /// Runs `op` on a worker and hands its result to `done` on that worker.
    /// A panic in `op` reaches `done` as [`ApiError::Internal`].
    pub fn submit<T, F, D>(&self, op: F, done: D)
    where
        T: 'static,
        F: FnOnce() -> Result<T, ApiError> + Send + 'static,
        D: FnOnce(Result<T, ApiError>) + Send + 'static,
    {
        let task: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                warn!("dispatch: operation panicked: {reason}");
                Err(ApiError::Internal(format!("operation panicked: {reason}")))
            });
            done(result)
        });
        if self.jobs.send(task).is_err() {
            warn!("dispatch: no workers left, dropping task");
        }
    }

    /// Runs `op` and calls exactly one of `on_success` or `on_failure`.
    pub fn call<T, F, S, E>(&self, op: F, on_success: S, on_failure: E)
    where
        T: 'static,
        F: FnOnce() -> Result<T, ApiError> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(ApiError) + Send + 'static,
    {
        self.submit(op, move |result| match result {
            Ok(value) => on_success(value),
            Err(err) => on_failure(err),
        });
    }

    /// Runs `op` and delivers the result on the returned channel. Dropping
    /// the receiver abandons the result; the call still runs to completion.
    pub fn request<T, F>(&self, op: F) -> Receiver<Result<T, ApiError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.submit(op, move |result| {
            let _ = tx.send(result);
        });
        rx
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".into()
    }
}

fn worker(idx: usize, jobs: Receiver<Task>, stop: Receiver<()>) {
    debug!("dispatch: worker {idx} started");
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => {
                match msg {
                    Ok(task) => {
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            warn!("dispatch: callback panicked on worker {idx}");
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
    debug!("dispatch: worker {idx} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn success_and_failure_callbacks_fire_once() {
        let dispatcher = Dispatcher::new(Config::default());
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = unbounded();

        for idx in 0..10 {
            let successes = successes.clone();
            let failures = failures.clone();
            let ok_done = done_tx.clone();
            let err_done = done_tx.clone();
            dispatcher.call(
                move || {
                    if idx % 2 == 0 {
                        Ok(idx)
                    } else {
                        Err(ApiError::Http {
                            code: 500,
                            body: String::new(),
                        })
                    }
                },
                move |_| {
                    successes.fetch_add(1, Ordering::SeqCst);
                    let _ = ok_done.send(());
                },
                move |err| {
                    assert_eq!(err.code(), 500);
                    failures.fetch_add(1, Ordering::SeqCst);
                    let _ = err_done.send(());
                },
            );
        }
        for _ in 0..10 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        drop(dispatcher);
        assert_eq!(successes.load(Ordering::SeqCst), 5);
        assert_eq!(failures.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn request_delivers_on_channel() {
        let dispatcher = Dispatcher::new(Config { workers: 1 });
        let rx = dispatcher.request(|| Ok::<_, ApiError>("done".to_string()));
        let value = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(value, "done");
    }

    #[test]
    fn abandoned_result_is_discarded() {
        let dispatcher = Dispatcher::new(Config { workers: 1 });
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        drop(dispatcher.request(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ApiError>(())
        }));
        let after = dispatcher.request(|| Ok::<_, ApiError>(7));
        assert_eq!(after.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), 7);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_operation_reports_failure_once() {
        let dispatcher = Dispatcher::new(Config { workers: 1 });
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        let (failed_tx, failed_rx) = unbounded();
        dispatcher.call(
            || -> Result<(), ApiError> { panic!("boom") },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            move |err| {
                let _ = failed_tx.send(err);
            },
        );

        let err = failed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("boom"));

        let rx = dispatcher.request(|| Ok::<_, ApiError>(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), 1);
        assert!(failed_rx.try_recv().is_err());
        assert_eq!(successes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_leaves_worker_running() {
        let dispatcher = Dispatcher::new(Config { workers: 1 });
        dispatcher.submit(|| Ok::<_, ApiError>(()), |_| panic!("callback"));
        let rx = dispatcher.request(|| Ok::<_, ApiError>(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), 1);
    }
}
