//! Keyed in-flight fetch deduplication
//!
//! At most one fetch runs per key. Callers that arrive while it runs join
//! it and receive a clone of its result. The fetch itself runs in its own
//! task so that a caller going away only abandons its own wait; the task is
//! aborted once no caller is left waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;

use crate::error::{AppError, SharedError};
use crate::metrics::DEREFERENCE_JOINED_TOTAL;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, SharedError>>>;

struct Flight<T> {
    id: u64,
    waiters: usize,
    abort: AbortHandle,
    shared: SharedFetch<T>,
}

type FlightMap<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

pub(crate) struct InFlight<T> {
    kind: &'static str,
    next_id: AtomicU64,
    flights: FlightMap<T>,
}

/// One caller's interest in a flight
struct Waiter<T> {
    flights: FlightMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(flight) = flights.get_mut(&self.key) else {
            return;
        };
        if flight.id != self.id {
            return;
        }

        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 {
            flight.abort.abort();
            flights.remove(&self.key);
            tracing::debug!(key = %self.key, "Abandoned fetch with no remaining waiters");
        }
    }
}

fn remove_flight<T>(flights: &FlightMap<T>, key: &str, id: u64) {
    let mut flights = flights.lock().unwrap_or_else(PoisonError::into_inner);
    if flights.get(key).is_some_and(|flight| flight.id == id) {
        flights.remove(key);
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(0),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `fetch` for `key`, or join the fetch already running for it
    ///
    /// `fetch` is only called when no flight exists. Its entry is removed
    /// as soon as it finishes, so a failure is seen by the callers joined
    /// to it and never by later ones.
    pub(crate) async fn run<F>(&self, key: &str, fetch: F) -> Result<T, AppError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, AppError>>,
    {
        let (shared, _waiter) = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);

            if let Some(flight) = flights.get_mut(key) {
                flight.waiters += 1;
                DEREFERENCE_JOINED_TOTAL
                    .with_label_values(&[self.kind])
                    .inc();
                tracing::debug!(kind = self.kind, key, "Joined in-flight fetch");

                let waiter = Waiter {
                    flights: self.flights.clone(),
                    key: key.to_string(),
                    id: flight.id,
                };
                (flight.shared.clone(), waiter)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let fut = fetch();

                let task_flights = self.flights.clone();
                let task_key = key.to_string();
                let handle = tokio::spawn(async move {
                    let result = fut.await.map_err(SharedError::from);
                    remove_flight(&task_flights, &task_key, id);
                    result
                });
                let abort = handle.abort_handle();

                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(error) if error.is_cancelled() => {
                            Err(SharedError::internal("fetch cancelled"))
                        }
                        Err(error) => Err(SharedError::internal(format!("fetch failed: {error}"))),
                    }
                }
                .boxed()
                .shared();

                flights.insert(
                    key.to_string(),
                    Flight {
                        id,
                        waiters: 1,
                        abort,
                        shared: shared.clone(),
                    },
                );

                let waiter = Waiter {
                    flights: self.flights.clone(),
                    key: key.to_string(),
                    id,
                };
                (shared, waiter)
            }
        };

        shared.await.map_err(AppError::from)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
