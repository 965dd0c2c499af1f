//! Sandbox environment pool with checkout/checkin semantics
//!
//! Provisioning an interpreter environment is the expensive step, so a
//! deployment may park released environments for reuse instead of
//! destroying them. The pool is an explicit object owned by whoever built
//! the executor; correctness never depends on it because every program run
//! in a pooled environment is self-contained (the protocol preamble is
//! rebuilt in full on each run).

use crate::sandbox::{Interpreter, InterpreterHost, InterpreterProvider, SessionError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, warn};

struct IdleEntry {
    interpreter: Box<dyn Interpreter>,
    parked_at: Instant,
}

/// Pool of provisioned interpreter environments
pub struct SandboxPool {
    provider: Arc<dyn InterpreterProvider>,
    idle: Mutex<Vec<IdleEntry>>,
    max_idle: usize,
}

impl SandboxPool {
    /// Create a pool over the given provider, parking at most `max_idle`
    /// released environments.
    pub fn new(provider: Arc<dyn InterpreterProvider>, max_idle: usize) -> Self {
        Self {
            provider,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take an idle environment, or provision a fresh one.
    pub async fn checkout(&self) -> Result<Box<dyn Interpreter>, SessionError> {
        if let Some(entry) = self.idle.lock().await.pop() {
            debug!("Reusing idle sandbox from pool");
            return Ok(entry.interpreter);
        }
        self.provider.provision().await
    }

    /// Return an environment to the pool, or destroy it when the idle list
    /// is full.
    pub async fn checkin(&self, mut interpreter: Box<dyn Interpreter>) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(IdleEntry {
                interpreter,
                parked_at: Instant::now(),
            });
        } else {
            drop(idle);
            interpreter.shutdown().await;
        }
    }

    /// Number of currently parked environments.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Destroy environments parked longer than `ttl`.
    pub async fn reap_idle(&self, ttl: Duration) {
        let mut reaped = Vec::new();
        {
            let mut idle = self.idle.lock().await;
            let mut kept = Vec::with_capacity(idle.len());
            for entry in idle.drain(..) {
                if entry.parked_at.elapsed() > ttl {
                    reaped.push(entry.interpreter);
                } else {
                    kept.push(entry);
                }
            }
            *idle = kept;
        }
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "Reaping idle sandboxes");
            for mut interpreter in reaped {
                interpreter.shutdown().await;
            }
        }
    }

    /// Start the background idle-reap task.
    pub fn start_reap_task(self: Arc<Self>, ttl: Duration, every: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                self.reap_idle(ttl).await;
            }
        });
    }

    /// Destroy every parked environment.
    pub async fn drain(&self) {
        let entries: Vec<_> = self.idle.lock().await.drain(..).collect();
        for mut entry in entries {
            entry.interpreter.shutdown().await;
        }
    }
}

#[async_trait]
impl InterpreterHost for SandboxPool {
    async fn acquire(&self) -> Result<Box<dyn Interpreter>, SessionError> {
        self.checkout().await
    }

    async fn release(&self, interpreter: Box<dyn Interpreter>) {
        self.checkin(interpreter).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::ScriptedProvider;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn checkin_then_checkout_reuses_environment() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![], vec![]]));
        let pool = SandboxPool::new(provider.clone(), 4);

        let first = pool.checkout().await.unwrap();
        pool.checkin(first).await;
        assert_eq!(pool.idle_count().await, 1);

        let _second = pool.checkout().await.unwrap();
        // Reused, not re-provisioned.
        assert_eq!(provider.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_pool_destroys_on_checkin() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![], vec![]]));
        let pool = SandboxPool::new(provider.clone(), 0);

        let env = pool.checkout().await.unwrap();
        pool.checkin(env).await;
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn reap_removes_expired_entries() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![]]));
        let pool = SandboxPool::new(provider, 4);

        let env = pool.checkout().await.unwrap();
        pool.checkin(env).await;

        pool.reap_idle(Duration::from_secs(60)).await;
        assert_eq!(pool.idle_count().await, 1);

        pool.reap_idle(Duration::ZERO).await;
        assert_eq!(pool.idle_count().await, 0);
    }
}
