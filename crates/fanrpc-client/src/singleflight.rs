//! Per-key call de-duplication.
//!
//! The first caller for a key starts the work and publishes it as a shared
//! future; callers arriving while it is in flight await the same future and
//! observe the same output. Different keys never wait on each other.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

pub struct SingleFlight<T: Clone> {
    calls: Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the future built by `make` unless a call for `key` is already in
    /// flight, in which case that call's output is returned instead.
    ///
    /// The boolean is `true` when the output was shared with another caller.
    pub async fn run<F>(&self, key: &str, make: F) -> (T, bool)
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            match calls.get(key) {
                Some(call) => (call.clone(), false),
                None => {
                    let call = make().shared();
                    calls.insert(key.to_string(), call.clone());
                    (call, true)
                }
            }
        };

        let out = call.clone().await;

        // Whoever finishes first clears the slot, unless a newer call
        // already replaced it.
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.get(key).is_some_and(|c| c.ptr_eq(&call)) {
            calls.remove(key);
        }
        (out, !leader)
    }

    pub fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
