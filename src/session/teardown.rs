//! Scoped teardown actions, run once in reverse registration order.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type TeardownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TeardownAction = Box<dyn FnOnce() -> TeardownFuture + Send>;

#[derive(Default)]
pub struct Teardown {
    actions: Mutex<Vec<(String, TeardownAction)>>,
    done: AtomicBool,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. Returns false (and drops it) once teardown has run.
    pub fn register<F, Fut>(&self, name: &str, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut actions = self.lock();
        // checked under the lock `run` takes before draining
        if self.is_done() {
            tracing::warn!("Teardown already ran; '{}' not registered", name);
            return false;
        }
        let boxed: TeardownAction = Box::new(move || -> TeardownFuture { Box::pin(action()) });
        actions.push((name.to_string(), boxed));
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Run every registered action, last registered first. Only the first
    /// call does anything; returns how many actions ran.
    pub async fn run(&self) -> usize {
        let actions = {
            let mut actions = self.lock();
            if self.done.swap(true, Ordering::SeqCst) {
                return 0;
            }
            std::mem::take(&mut *actions)
        };
        let count = actions.len();
        for (name, action) in actions.into_iter().rev() {
            tracing::debug!("Teardown: {}", name);
            action().await;
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, TeardownAction)>> {
        self.actions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
