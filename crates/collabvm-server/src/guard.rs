//! Serialized access to shared mutable state.
//!
//! Every shared resource in the server (the database handle, the settings
//! snapshot, each VM, each channel, every per-connection state block) is
//! owned by a [`Guard`]. A guard runs one callback at a time against its
//! resource; callbacks queued on the same guard run in submission order,
//! while distinct guards run concurrently. No other locking appears in this
//! crate.

use std::sync::Arc;

use tokio::sync::Mutex;

pub struct Guard<R> {
    inner: Arc<Mutex<R>>,
}

impl<R> Clone for Guard<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + 'static> Guard<R> {
    pub fn new(resource: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(resource)),
        }
    }

    /// Run `f` against the resource once every previously submitted callback
    /// has finished. The callback is synchronous, so it can never hold the
    /// resource across a suspension point.
    pub async fn dispatch<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut resource = self.inner.lock().await;
        f(&mut resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_returns_closure_result() {
        let guard = Guard::new(41u32);
        let out = guard
            .dispatch(|n| {
                *n += 1;
                *n
            })
            .await;
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn callbacks_are_serialized() {
        let guard = Guard::new(Vec::<u32>::new());
        let mut tasks = Vec::new();
        for i in 0..32u32 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move {
                guard.dispatch(move |v| v.push(i)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let len = guard.dispatch(|v| v.len()).await;
        assert_eq!(len, 32);
    }

    #[tokio::test]
    async fn distinct_guards_do_not_block_each_other() {
        let a = Guard::new(0u32);
        let b = Guard::new(0u32);
        let (ra, rb) = tokio::join!(a.dispatch(|n| *n + 1), b.dispatch(|n| *n + 2));
        assert_eq!((ra, rb), (1, 2));
    }
}
