use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GatewayAddress, GatewayDirectory, GatewayListListener};
use crate::error::{GatewayError, Result};

/// Tracks which gateways are known, live and recently dead.
///
/// Reads of the live list never block: the list is an immutable snapshot swapped on every change. Mutations take a
/// short internal lock that is never held across an await or a call into another component.
pub struct GatewayManager {
    directory: Arc<dyn GatewayDirectory>,
    refresh_period: Duration,
    live: ArcSwap<Vec<GatewayAddress>>,
    state: Mutex<ManagerState>,
    refresh_in_flight: AtomicBool,
    live_count: watch::Sender<usize>,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<GatewayManager>,
}

#[derive(Default)]
struct ManagerState {
    known: Vec<GatewayAddress>,
    dead: HashMap<GatewayAddress, Instant>,
    cursor: usize,
}

impl GatewayManager {
    /// Creates a manager over `directory`. No gateways are known until [`start`](Self::start).
    pub fn new(
        directory: Arc<dyn GatewayDirectory>,
        refresh_period: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (live_count, _) = watch::channel(0);
        Arc::new_cyclic(|weak_self| GatewayManager {
            directory,
            refresh_period,
            live: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(ManagerState::default()),
            refresh_in_flight: AtomicBool::new(false),
            live_count,
            cancel,
            refresh_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Loads the initial gateway list, subscribes to pushed updates and starts the periodic refresh.
    pub async fn start(&self) -> Result<()> {
        let gateways = self
            .directory
            .get_gateways()
            .await
            .map_err(GatewayError::Directory)?;
        self.apply_gateway_list(gateways);
        if self.live.load().is_empty() {
            warn!("gateway directory lists no gateways");
        }

        if self.directory.is_updatable() {
            let listener = Arc::new(ManagerListener(self.weak_self.clone()));
            if self.directory.subscribe(listener) {
                debug!("subscribed to gateway list updates");
            }
        }

        let task = self.spawn_refresh_timer();
        if let Some(previous) = self.refresh_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops the periodic refresh.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
    }

    /// The current live gateways.
    ///
    /// An empty list triggers an expedited refresh, but the call itself never waits for it.
    pub fn live_gateways(&self) -> Arc<Vec<GatewayAddress>> {
        let live = self.live.load_full();
        if live.is_empty() {
            self.expedite_refresh();
        }
        live
    }

    /// Number of live gateways.
    pub fn live_count(&self) -> usize {
        self.live.load().len()
    }

    /// Subscribes to changes in the number of live gateways.
    pub fn watch_live_count(&self) -> watch::Receiver<usize> {
        self.live_count.subscribe()
    }

    /// Whether `address` is in the live list.
    pub fn is_live(&self, address: &GatewayAddress) -> bool {
        self.live.load().contains(address)
    }

    /// Picks the next live gateway in round-robin order.
    pub fn next_gateway(&self) -> Option<GatewayAddress> {
        let next = {
            let mut state = self.state.lock();
            let live = self.live.load();
            if live.is_empty() {
                None
            } else {
                let index = state.cursor % live.len();
                state.cursor = state.cursor.wrapping_add(1);
                Some(live[index])
            }
        };
        if next.is_none() {
            self.expedite_refresh();
        }
        next
    }

    /// Excludes `address` from the live list for the directory's staleness window.
    pub fn mark_dead(&self, address: GatewayAddress) {
        let remaining = {
            let mut state = self.state.lock();
            state.dead.insert(address, Instant::now());
            let live: Vec<_> = self
                .live
                .load()
                .iter()
                .copied()
                .filter(|gateway| *gateway != address)
                .collect();
            let remaining = live.len();
            self.live.store(Arc::new(live));
            remaining
        };
        self.live_count.send_replace(remaining);
        warn!(gateway = %address, remaining, "marked gateway dead");

        if remaining == 0 {
            self.expedite_refresh();
        }
    }

    /// Starts a refresh in the background unless one is already running. Returns whether one was started.
    pub fn expedite_refresh(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let Some(manager) = self.weak_self.upgrade() else {
            return false;
        };
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        debug!("expediting gateway list refresh");
        runtime.spawn(async move {
            if let Err(err) = manager.refresh_now().await {
                warn!(error = %err, "expedited gateway list refresh failed");
            }
            manager.refresh_in_flight.store(false, Ordering::Release);
        });
        true
    }

    /// Re-reads the directory and recomputes the live list.
    ///
    /// Does nothing if another refresh is in flight.
    pub async fn refresh(&self) -> Result<()> {
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let result = self.refresh_now().await;
        self.refresh_in_flight.store(false, Ordering::Release);
        result
    }

    async fn refresh_now(&self) -> Result<()> {
        let gateways = self
            .directory
            .get_gateways()
            .await
            .map_err(GatewayError::Directory)?;
        if gateways.is_empty() && !self.state.lock().known.is_empty() {
            warn!("gateway directory returned no gateways, keeping the previous list");
            return Ok(());
        }
        self.apply_gateway_list(gateways);
        Ok(())
    }

    /// Replaces the known gateways and recomputes the live list from them.
    pub(crate) fn apply_gateway_list(&self, gateways: Vec<GatewayAddress>) {
        let max_staleness = self.directory.max_staleness();
        let now = Instant::now();
        let known: Vec<_> = gateways.into_iter().unique().collect();

        let (live, fell_back) = {
            let mut state = self.state.lock();
            state
                .dead
                .retain(|_, marked_at| now.duration_since(*marked_at) < max_staleness);
            let mut live: Vec<_> = known
                .iter()
                .copied()
                .filter(|gateway| !state.dead.contains_key(gateway))
                .collect();
            let fell_back = live.is_empty() && !known.is_empty();
            if fell_back {
                live = known.clone();
            }
            state.known = known;
            let live = Arc::new(live);
            self.live.store(live.clone());
            (live, fell_back)
        };

        if fell_back {
            warn!(
                known = live.len(),
                "every known gateway was recently marked dead, retrying all of them"
            );
        }
        self.live_count.send_replace(live.len());
        info!(live = live.len(), "refreshed gateway list");
    }

    fn spawn_refresh_timer(&self) -> JoinHandle<()> {
        let manager = self.weak_self.clone();
        let cancel = self.cancel.clone();
        let period = self.refresh_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if let Err(err) = manager.refresh().await {
                            warn!(error = %err, "periodic gateway list refresh failed");
                        }
                    }
                }
            }
            debug!("gateway list refresh timer stopped");
        })
    }
}

impl Drop for GatewayManager {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayManager")
            .field("live", &self.live.load())
            .field("refresh_period", &self.refresh_period)
            .finish()
    }
}

struct ManagerListener(Weak<GatewayManager>);

impl GatewayListListener for ManagerListener {
    fn gateway_list_updated(&self, gateways: Vec<GatewayAddress>) {
        if let Some(manager) = self.0.upgrade() {
            debug!(count = gateways.len(), "received gateway list update");
            manager.apply_gateway_list(gateways);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::test_helpers::{gateway_addr, TestDirectory};

    fn manager(directory: Arc<TestDirectory>) -> Arc<GatewayManager> {
        GatewayManager::new(directory, Duration::from_secs(60), CancellationToken::new())
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let gateways: Vec<_> = (1..=3).map(gateway_addr).collect();
        let manager = manager(Arc::new(TestDirectory::new(gateways.clone())));
        manager.start().await.unwrap();

        let mut counts = HashMap::new();
        for _ in 0..3 * 5 {
            *counts.entry(manager.next_gateway().unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|count| *count == 5));
    }

    #[tokio::test]
    async fn duplicate_addresses_collapse() {
        let manager = manager(Arc::new(TestDirectory::new([
            gateway_addr(1),
            gateway_addr(1),
            gateway_addr(2),
        ])));
        manager.start().await.unwrap();
        assert_eq!(*manager.live_gateways(), vec![gateway_addr(1), gateway_addr(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_gateways_stay_excluded_for_the_staleness_window() {
        let directory = Arc::new(
            TestDirectory::new([gateway_addr(1), gateway_addr(2)])
                .with_max_staleness(Duration::from_secs(10)),
        );
        let manager = manager(directory.clone());
        manager.start().await.unwrap();
        let mut live_count = manager.watch_live_count();
        assert_eq!(*live_count.borrow_and_update(), 2);

        manager.mark_dead(gateway_addr(1));
        assert!(!manager.is_live(&gateway_addr(1)));
        assert_eq!(*live_count.borrow_and_update(), 1);

        // The directory still lists it, but it was marked dead too recently.
        tokio::time::advance(Duration::from_secs(5)).await;
        manager.refresh().await.unwrap();
        assert_eq!(*manager.live_gateways(), vec![gateway_addr(2)]);

        tokio::time::advance(Duration::from_secs(6)).await;
        manager.refresh().await.unwrap();
        assert_eq!(manager.live_count(), 2);
        assert!(manager.is_live(&gateway_addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_known_gateways_when_all_are_dead() {
        let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
        let manager = manager(directory.clone());
        manager.start().await.unwrap();

        manager.mark_dead(gateway_addr(1));
        assert_eq!(manager.live_count(), 0);
        assert!(manager.next_gateway().is_none());

        // The empty list expedited a refresh, which falls back to the full known list.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.next_gateway(), Some(gateway_addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn expedite_is_a_no_op_while_a_refresh_is_running() {
        let directory = Arc::new(
            TestDirectory::new([gateway_addr(1)]).with_delay(Duration::from_secs(1)),
        );
        let manager = manager(directory.clone());
        manager.start().await.unwrap();
        assert_eq!(directory.calls(), 1);

        assert!(manager.expedite_refresh());
        assert!(!manager.expedite_refresh());
        assert!(!manager.expedite_refresh());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(directory.calls(), 2);

        assert!(manager.expedite_refresh());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(directory.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_picks_up_new_gateways() {
        let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
        let manager = manager(directory.clone());
        manager.start().await.unwrap();

        directory.set_gateways([gateway_addr(1), gateway_addr(2)]);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(manager.live_count(), 2);

        manager.stop();
        directory.set_gateways([gateway_addr(3)]);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!manager.is_live(&gateway_addr(3)));
    }

    #[tokio::test]
    async fn pushed_updates_replace_the_list() {
        let directory = Arc::new(TestDirectory::new([gateway_addr(1)]).updatable());
        let manager = manager(directory.clone());
        manager.start().await.unwrap();

        directory.push([gateway_addr(4), gateway_addr(5)]);
        assert_eq!(*manager.live_gateways(), vec![gateway_addr(4), gateway_addr(5)]);
    }

    #[tokio::test]
    async fn directory_errors_surface_from_start() {
        let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
        directory.set_failing(true);
        let manager = manager(directory);
        assert!(matches!(
            manager.start().await,
            Err(GatewayError::Directory(_))
        ));
    }
}
