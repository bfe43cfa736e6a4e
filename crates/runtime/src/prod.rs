//! Production implementation of the `Runtime` trait, backed by a real
//! `tokio` executor.

use std::{
    future::Future,
    pin::Pin,
    time::SystemTime,
};

use futures::{
    future::BoxFuture,
    FutureExt,
    TryFutureExt,
};
use rand::rngs::ThreadRng;
use tokio::runtime::Handle as TokioHandle;

use crate::{
    JoinError,
    Runtime,
    SpawnHandle,
};

pub struct TaskHandle {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SpawnHandle for TaskHandle {
    fn shutdown(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move {
            match self.handle.take() {
                Some(handle) => handle.map_err(JoinError::from).await,
                None => Ok(()),
            }
        }
        .boxed()
    }
}

/// A `Runtime` that spawns onto an existing `tokio` executor. Cloning is
/// cheap: it's just a handle to the shared executor.
#[derive(Clone)]
pub struct TokioRuntime {
    handle: TokioHandle,
}

impl TokioRuntime {
    pub fn new(handle: TokioHandle) -> Self {
        Self { handle }
    }
}

impl Runtime for TokioRuntime {
    fn wait(&self, duration: std::time::Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = self.handle.spawn(async move {
            tracing::debug!(task = name, "spawned background task");
            f.await;
        });
        Box::new(TaskHandle {
            handle: Some(handle),
        })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn rand::RngCore> {
        Box::new(ThreadRng::default())
    }
}
