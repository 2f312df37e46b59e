//! Tracks pods between admission and their first appearance on the watch.
//!
//! After the webhook admits a pod there is a window before the watch sees
//! the object, during which another admission of the same group would read
//! stale standing. The tracker lets an admitting request briefly wait for
//! a previously admitted pod of the same group to land. Best effort: some
//! races are unavoidable, the tracker only narrows the window. Flights
//! that exceed `max_flight_duration` are force-landed by a background
//! sweep so waiters always terminate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FlightError {
    #[error("unable to derive a unique name for object")]
    Unnamed,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("deadline exceeded waiting for a flight to land")]
    DeadlineExceeded,
}

/// The admission path's view of the tracker.
#[async_trait]
pub trait FlightWaiter: Send + Sync {
    fn track(&self, key: &str, meta: &ObjectMeta) -> Result<(), FlightError>;

    async fn wait_one(
        &self,
        key: &str,
        deadline: Duration,
    ) -> Result<(), WaitError>;
}

struct Flight {
    name: String,
    namespace: String,
    tracked_at: Instant,
}

struct FlightList {
    pending: VecDeque<Flight>,
    landed: Arc<Notify>,
    seen: HashSet<String>,
}

impl FlightList {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            landed: Arc::new(Notify::new()),
            seen: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    flights_by_key: HashMap<String, FlightList>,
    seen_keys_by_name: HashMap<String, String>,
}

pub struct FlightTracker {
    state: Mutex<TrackerState>,
    max_flight_duration: Duration,
    group_label: String,
}

impl FlightTracker {
    pub fn new(
        max_flight_duration: Duration,
        group_label: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState::default()),
            max_flight_duration,
            group_label: group_label.into(),
        })
    }

    /// Creates a tracker and starts its force-landing sweep. Requires a
    /// tokio runtime.
    pub fn spawn(
        max_flight_duration: Duration,
        group_label: impl Into<String>,
    ) -> Arc<Self> {
        let tracker = Self::new(max_flight_duration, group_label);
        tokio::spawn(tracker.clone().run_sweeper());
        tracker
    }

    /// Marks an observed pod as landed, matching pending flights by exact
    /// name first and generateName second (latest first). Observing an
    /// already seen pod is a no-op.
    pub fn observe(&self, pod: &Pod) {
        let Some(key) = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.group_label))
        else {
            return;
        };
        let namespace =
            pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let namespaced_name = format!("{namespace}/{name}");

        let mut notify = None;
        {
            let mut state = self.state.lock().expect("tracker lock");
            let Some(list) = state.flights_by_key.get_mut(key) else {
                debug!(key, "no flight entry for observed pod");
                return;
            };
            if list.seen.contains(&namespaced_name) {
                return;
            }

            let mut matched = None;
            if !name.is_empty() {
                matched = list.pending.iter().rposition(|f| {
                    f.name == name && f.namespace == namespace
                });
            }
            if matched.is_none() {
                let generate_name =
                    pod.metadata.generate_name.as_deref().unwrap_or_default();
                if !generate_name.is_empty() {
                    matched = list.pending.iter().rposition(|f| {
                        f.name == generate_name && f.namespace == namespace
                    });
                }
            }

            if let Some(index) = matched {
                list.pending.remove(index);
                list.seen.insert(namespaced_name.clone());
                notify = Some(list.landed.clone());
                let key = key.clone();
                state
                    .seen_keys_by_name
                    .insert(namespaced_name.clone(), key);
            } else {
                debug!(key, %namespaced_name, "no matching flight found");
            }
        }
        if let Some(notify) = notify {
            debug!(%namespaced_name, "flight landed");
            notify.notify_one();
        }
    }

    /// Drops a deleted pod from the seen set so a future pod with the same
    /// namespaced name can land again.
    pub fn forget(&self, pod: &Pod) {
        let namespaced_name = format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        );
        let mut state = self.state.lock().expect("tracker lock");
        if let Some(key) = state.seen_keys_by_name.remove(&namespaced_name) {
            if let Some(list) = state.flights_by_key.get_mut(&key) {
                list.seen.remove(&namespaced_name);
            }
        }
    }

    pub async fn run_sweeper(self: Arc<Self>) {
        info!("starting flight tracker sweep");
        loop {
            tokio::time::sleep(self.max_flight_duration / 2).await;
            let mut notifications = Vec::new();
            {
                let mut state = self.state.lock().expect("tracker lock");
                state.flights_by_key.retain(|_, list| {
                    !list.pending.is_empty() || !list.seen.is_empty()
                });
                for (key, list) in state.flights_by_key.iter_mut() {
                    let max = self.max_flight_duration;
                    let before = list.pending.len();
                    list.pending
                        .retain(|f| f.tracked_at.elapsed() <= max);
                    let landed = before - list.pending.len();
                    if landed > 0 {
                        info!(key, landed, "force landing expired flights");
                        for _ in 0..landed {
                            notifications.push(list.landed.clone());
                        }
                    }
                }
            }
            for notify in notifications {
                notify.notify_one();
            }
        }
    }
}

#[async_trait]
impl FlightWaiter for FlightTracker {
    /// Registers a pod as in flight until the watch observes it. Pods that
    /// only carry a generateName are tracked under that prefix.
    fn track(&self, key: &str, meta: &ObjectMeta) -> Result<(), FlightError> {
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(meta.generate_name.as_deref())
            .filter(|n| !n.is_empty())
            .ok_or(FlightError::Unnamed)?;
        let namespace = meta.namespace.as_deref().unwrap_or_default();

        let mut state = self.state.lock().expect("tracker lock");
        let list = state
            .flights_by_key
            .entry(key.to_string())
            .or_insert_with(FlightList::new);
        list.pending.push_back(Flight {
            name: name.to_string(),
            namespace: namespace.to_string(),
            tracked_at: Instant::now(),
        });

        debug!(key, name, namespace, "tracking new flight");
        Ok(())
    }

    /// Waits until one flight with this key lands or the deadline passes.
    /// Returns immediately when nothing is in flight.
    async fn wait_one(
        &self,
        key: &str,
        deadline: Duration,
    ) -> Result<(), WaitError> {
        let notify = {
            let state = self.state.lock().expect("tracker lock");
            match state.flights_by_key.get(key) {
                None => return Ok(()),
                Some(list) if list.pending.is_empty() => return Ok(()),
                Some(list) => list.landed.clone(),
            }
        };

        tokio::time::timeout(deadline, notify.notified())
            .await
            .map_err(|_| WaitError::DeadlineExceeded)
    }
}

/// Tracker that never waits; used where the admission path should not
/// serialize against in-flight pods.
pub struct NoopFlightTracker;

#[async_trait]
impl FlightWaiter for NoopFlightTracker {
    fn track(
        &self,
        _key: &str,
        _meta: &ObjectMeta,
    ) -> Result<(), FlightError> {
        Ok(())
    }

    async fn wait_one(
        &self,
        _key: &str,
        _deadline: Duration,
    ) -> Result<(), WaitError> {
        Ok(())
    }
}
