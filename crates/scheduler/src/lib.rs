//! Polling scheduler (C5, §4.4). Owns the in-memory schedule map and drives
//! the tick loop: reconcile against the query registry, fire due entries,
//! reschedule with staggered spacing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use marketwatch_client::{FetchClient, DEFAULT_RETRY_STATUSES};
use marketwatch_core::{NotifierError, QueryStatus, SearchResponse};
use marketwatch_pipeline::DEFAULT_ENRICH_COUNT;
use marketwatch_publisher::Publisher;
use marketwatch_storage::Storage;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// `request_url → due_time` (§3.1 `ScheduleEntry`). Single writer: the
/// scheduler loop itself — grounded in the same "one owner, no aliasing"
/// shape the teacher's frontier crate documents for its queue map.
type ScheduleMap = HashMap<String, DateTime<Utc>>;

pub struct Scheduler {
    storage: Arc<Storage>,
    publisher: Arc<Publisher>,
    client: Arc<FetchClient>,
    map: Mutex<ScheduleMap>,
    interval: Duration,
    enrich_count: usize,
    tick: Duration,
    poll_idle: Duration,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        publisher: Arc<Publisher>,
        client: Arc<FetchClient>,
        interval_seconds: u64,
        enrich_count: usize,
        tick_seconds: u64,
        poll_idle_seconds: u64,
    ) -> Self {
        Self {
            storage,
            publisher,
            client,
            map: Mutex::new(HashMap::new()),
            interval: Duration::from_secs(interval_seconds.max(1)),
            enrich_count,
            tick: Duration::from_secs(tick_seconds.max(1)),
            poll_idle: Duration::from_secs(poll_idle_seconds.max(1)),
        }
    }

    pub fn with_defaults(storage: Arc<Storage>, publisher: Arc<Publisher>, client: Arc<FetchClient>) -> Self {
        Self::new(storage, publisher, client, 120, DEFAULT_ENRICH_COUNT, 10, 10)
    }

    /// Seed the schedule by spreading every active query across `interval`
    /// (§4.4.1 `initialize_schedule`).
    pub async fn initialize_schedule(&self) -> Result<(), NotifierError> {
        let active = self.storage.list_queries(Some(QueryStatus::Active)).await?;
        let now = Utc::now();

        let mut map = self.map.lock().await;
        for (i, query) in active.iter().enumerate() {
            let due = stagger_due_time(now, i, active.len(), self.interval);
            map.insert(query.request_url.clone(), due);
            self.storage.update_next_check(&query.request_url, due).await?;
        }
        Ok(())
    }

    /// Runs the tick loop forever (§4.4.1). Never returns under normal
    /// operation; shutdown is by terminating the process (§5).
    pub async fn run(&self) -> Result<(), NotifierError> {
        loop {
            self.tick_once().await?;
            tokio::time::sleep(self.tick).await;
        }
    }

    /// One iteration of the `loop forever` body in §4.4.1 — exposed
    /// separately so tests can drive individual ticks without sleeping.
    pub async fn tick_once(&self) -> Result<(), NotifierError> {
        let active = self.storage.list_queries(Some(QueryStatus::Active)).await?;
        if active.is_empty() {
            tokio::time::sleep(self.poll_idle).await;
            return Ok(());
        }
        let active_urls: std::collections::HashSet<String> =
            active.iter().map(|q| q.request_url.clone()).collect();

        {
            let mut map = self.map.lock().await;
            map.retain(|url, _| active_urls.contains(url));

            let now = Utc::now();
            for url in &active_urls {
                if !map.contains_key(url) {
                    map.insert(url.clone(), now);
                    self.storage.update_next_check(url, now).await?;
                }
            }
        }

        self.process_ready().await?;
        self.log_upcoming().await;
        Ok(())
    }

    /// §4.4.2. Ready entries are identified under the lock, then dispatched
    /// — concurrently once identified, since each future confines its own
    /// map write and LatestListing upsert to its own `request_url` (§5's
    /// allowed promotion to concurrent fan-out).
    async fn process_ready(&self) -> Result<(), NotifierError> {
        let now = Utc::now();
        let (ready, last, map_len): (Vec<String>, DateTime<Utc>, usize) = {
            let map = self.map.lock().await;
            let ready: Vec<String> = map.iter().filter(|(_, t)| **t <= now).map(|(u, _)| u.clone()).collect();
            let last = map.values().copied().max().unwrap_or(now);
            (ready, last, map.len())
        };

        if ready.len() > 1 {
            let active_count = self.map.lock().await.len();
            self.publisher
                .publish_warning(
                    &format!("{} queries ready concurrently", ready.len()),
                    &format!("total active queries: {active_count}"),
                )
                .await?;
        }

        let interval = self.interval;
        let futures = ready.into_iter().enumerate().map(move |(i, url)| {
            let next_due = stagger_due_time(last, i + 1, map_len, interval);
            self.fire(url, next_due)
        });
        join_all(futures).await;
        Ok(())
    }

    /// Fetch, process, and reschedule a single due entry (§4.4.2/§4.4.3
    /// state machine: SCHEDULED → FIRING → {SCHEDULED, FAILED}).
    async fn fire(&self, request_url: String, next_due: DateTime<Utc>) {
        match self.fire_inner(&request_url).await {
            Ok(()) => {
                let mut map = self.map.lock().await;
                map.insert(request_url.clone(), next_due);
                drop(map);
                if let Err(e) = self.storage.update_next_check(&request_url, next_due).await {
                    error!(
                        request_url = %request_url,
                        error = %e,
                        "failed to persist next_check_time; in-memory schedule and durable record now disagree (§3.2 invariant 3)"
                    );
                }
            }
            Err(e) => {
                warn!(request_url = %request_url, error = %e, "query failed, marking FAILED");
                if let Err(publish_err) = self
                    .publisher
                    .publish_request_url_error(&request_url, e.kind_name(), &e.to_string(), None)
                    .await
                {
                    error!(
                        request_url = %request_url,
                        error = %publish_err,
                        original_error = %e,
                        "failed to publish request_url_error event"
                    );
                }
                if let Err(status_err) = self
                    .storage
                    .set_status_by_request_url(&request_url, QueryStatus::Failed)
                    .await
                {
                    error!(
                        request_url = %request_url,
                        error = %status_err,
                        "failed to mark query FAILED; it remains ACTIVE in storage but is being dropped from the schedule"
                    );
                }
                let mut map = self.map.lock().await;
                map.remove(&request_url);
            }
        }
    }

    async fn fire_inner(&self, request_url: &str) -> Result<(), NotifierError> {
        let body = self.client.fetch_text(request_url, DEFAULT_RETRY_STATUSES).await?;
        let response: SearchResponse = serde_json::from_str(&body).map_err(|e| NotifierError::Parse(e.to_string()))?;
        marketwatch_pipeline::process(
            &self.storage,
            &self.publisher,
            &self.client,
            request_url,
            response.listings,
            self.enrich_count,
        )
        .await
    }

    async fn log_upcoming(&self) {
        let map = self.map.lock().await;
        let mut entries: Vec<(&String, &DateTime<Utc>)> = map.iter().collect();
        entries.sort_by_key(|(_, t)| **t);
        for (url, due) in entries.into_iter().take(5) {
            info!(request_url = %url, due_time = %due, "upcoming");
        }
    }
}

/// Pure stagger arithmetic shared by `initialize_schedule` and
/// `process_ready` (§4.4.1/§4.4.2): the `index`-th of `count` entries spread
/// across `interval` is due `index * (interval / count)` after `base`.
/// `initialize_schedule` calls this with `base = now`, `index` 0-based;
/// `process_ready` calls it with `base = last` and `index` offset by one so
/// rescheduled entries land strictly after the existing horizon (§4.4.2,
/// "why stagger from `last`, not `now`").
fn stagger_due_time(base: DateTime<Utc>, index: usize, count: usize, interval: Duration) -> DateTime<Utc> {
    let spread = interval.as_secs_f64() / (count.max(1) as f64);
    base + chrono::Duration::milliseconds((index as f64 * spread * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// §8.1 "stagger bound": the due times `stagger_due_time` actually
    /// produces for `initialize_schedule`'s 0-based call convention must lie
    /// within `[now, now + interval + spread]`.
    #[test]
    fn stagger_math_spreads_entries_within_interval_bound() {
        let interval = Duration::from_secs(120);
        let n = 6usize;
        let spread_ms = (interval.as_secs_f64() / n as f64 * 1000.0) as i64;
        let now = Utc::now();

        let due_times: Vec<DateTime<Utc>> = (0..n).map(|i| stagger_due_time(now, i, n, interval)).collect();

        assert_eq!(due_times.len(), n);
        for t in &due_times {
            assert!(*t >= now);
            assert!(*t <= now + chrono::Duration::seconds(120) + chrono::Duration::milliseconds(spread_ms));
        }
    }

    /// §4.4.1 `initialize_schedule`: the first entry (index 0) fires at
    /// `base` itself, with no stagger offset.
    #[test]
    fn stagger_due_time_first_index_has_no_offset() {
        let now = Utc::now();
        assert_eq!(stagger_due_time(now, 0, 4, Duration::from_secs(120)), now);
    }

    /// §4.4.2 `process_ready`: rescheduling uses a 1-based offset from
    /// `last` so the new due time lands strictly after the existing horizon
    /// ("why stagger from `last`, not `now`").
    #[test]
    fn stagger_due_time_from_last_is_strictly_after_the_horizon() {
        let last = Utc::now();
        let due = stagger_due_time(last, 1, 3, Duration::from_secs(120));
        assert!(due > last);
        assert_eq!(due, last + chrono::Duration::milliseconds(40_000));
    }

    /// A single entry spreads across the whole interval with index 0 — the
    /// `count.max(1)` guard means an empty map never divides by zero.
    #[test]
    fn stagger_due_time_guards_against_empty_count() {
        let now = Utc::now();
        let due = stagger_due_time(now, 0, 0, Duration::from_secs(120));
        assert_eq!(due, now);
    }
}
