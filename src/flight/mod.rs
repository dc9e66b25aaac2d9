//! Single-flight coordination: at most one execution per key at a time.
//!
//! The first caller for a key becomes the leader and spawns the work on its
//! own task. Callers arriving while it runs subscribe to the same watch
//! channel and receive a clone of the leader's output. Publishing the output
//! and removing the in-flight token happen under the same map shard lock, so a
//! caller arriving afterwards starts a new flight instead of joining a
//! finished one.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlightError {
    /// The leader's work stopped without producing a value (it panicked or
    /// the runtime shut down).
    #[error("in-flight resolution was abandoned")]
    Abandoned,
}

/// How a caller obtained its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Waiter,
}

struct Flight<T> {
    id: u64,
    tx: watch::Sender<Option<T>>,
}

pub struct SingleFlight<K, T> {
    flights: Arc<DashMap<K, Flight<T>>>,
    next_id: AtomicU64,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of keys with an execution in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }

    /// Run `work` for `key` unless an execution is already in progress, in
    /// which case wait for it and share its output.
    ///
    /// `work` is only invoked by the leader. Dropping the returned future does
    /// not cancel the spawned execution.
    pub async fn run_exclusive<F, Fut>(
        &self,
        key: K,
        work: F,
    ) -> Result<(T, FlightRole), FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut rx = match self.flights.entry(key.clone()) {
            Entry::Occupied(flight) => {
                let rx = flight.get().tx.subscribe();
                drop(flight);
                return wait_for_output(rx)
                    .await
                    .map(|value| (value, FlightRole::Waiter));
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Flight { id, tx });
                let guard = FlightGuard {
                    flights: Arc::clone(&self.flights),
                    key: key.clone(),
                    id,
                    published: false,
                };
                Self::launch(guard, work());
                rx
            }
        };

        match rx.wait_for(Option::is_some).await {
            Ok(value) => value
                .clone()
                .map(|value| (value, FlightRole::Leader))
                .ok_or(FlightError::Abandoned),
            Err(_) => Err(FlightError::Abandoned),
        }
    }

    fn launch<Fut>(mut guard: FlightGuard<K, T>, fut: Fut)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        tokio::spawn(async move {
            let output = fut.await;
            guard.publish(output);
        });
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_output<T: Clone>(
    mut rx: watch::Receiver<Option<T>>,
) -> Result<T, FlightError> {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone().ok_or(FlightError::Abandoned),
        Err(_) => Err(FlightError::Abandoned),
    }
}

/// Owns the leader's in-flight token. Dropping it without publishing (the
/// work panicked) removes the token so waiters see a closed channel.
struct FlightGuard<K, T>
where
    K: Eq + Hash,
{
    flights: Arc<DashMap<K, Flight<T>>>,
    key: K,
    id: u64,
    published: bool,
}

impl<K, T> FlightGuard<K, T>
where
    K: Eq + Hash + Clone,
{
    fn publish(&mut self, output: T) {
        if let Entry::Occupied(flight) = self.flights.entry(self.key.clone())
            && flight.get().id == self.id
        {
            flight.get().tx.send_replace(Some(output));
            flight.remove();
        }
        self.published = true;
    }
}

impl<K, T> Drop for FlightGuard<K, T>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if !self.published {
            log::error!("In-flight task ended without a result; releasing waiters");
            self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
        }
    }
}
