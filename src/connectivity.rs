//! Tri-state connectivity: device link plus backend reachability.
//!
//! The monitor combines an OS-level link signal with a periodic authenticated
//! probe so the UI can tell "no network" apart from "server unreachable".
//! Probing only happens while the surface is in the foreground.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::ApiGateway;
use crate::config::ConfigSource;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  /// The device has no network link
  Offline,
  /// The link is up but the configured backend does not answer
  ServerUnreachable,
}

impl ConnectivityState {
  /// Derive the state from the link, whether credentials are configured and
  /// the outcome of the last probe.
  pub fn derive(link_up: bool, has_credentials: bool, backend_reachable: bool) -> Self {
    if !link_up {
      ConnectivityState::Offline
    } else if has_credentials && !backend_reachable {
      ConnectivityState::ServerUnreachable
    } else {
      ConnectivityState::Online
    }
  }

  pub fn is_online(&self) -> bool {
    matches!(self, ConnectivityState::Online)
  }

  pub fn label(&self) -> &'static str {
    match self {
      ConnectivityState::Online => "online",
      ConnectivityState::Offline => "offline",
      ConnectivityState::ServerUnreachable => "server unreachable",
    }
  }
}

/// Source of the device-level link state.
pub trait LinkSignal: Send + Sync {
  fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Link signal derived from whether the OS has a route to the internet.
///
/// Connecting a UDP socket only consults the routing table; no packet is sent.
pub struct RouteLink {
  tx: watch::Sender<bool>,
}

impl RouteLink {
  pub fn spawn(scheduler: &Scheduler, every: Duration) -> Arc<Self> {
    let (tx, _rx) = watch::channel(has_route());
    let link = Arc::new(Self { tx });

    let polled = link.clone();
    scheduler.spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        let up = tokio::task::spawn_blocking(has_route)
          .await
          .unwrap_or(false);
        polled.tx.send_if_modified(|current| {
          if *current == up {
            return false;
          }
          info!(link_up = up, "Link state changed");
          *current = up;
          true
        });
      }
    });

    link
  }
}

impl LinkSignal for RouteLink {
  fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

fn has_route() -> bool {
  UdpSocket::bind(("0.0.0.0", 0))
    .and_then(|socket| socket.connect(("1.1.1.1", 53)))
    .is_ok()
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
  /// Time between probes while foregrounded with the link up
  pub probe_interval: Duration,
  /// Upper bound for a single probe
  pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      probe_interval: Duration::from_secs(30),
      probe_timeout: Duration::from_secs(5),
    }
  }
}

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Signals {
  link_up: bool,
  foreground: bool,
  backend_reachable: bool,
}

struct MonitorInner {
  gateway: Arc<dyn ApiGateway>,
  config_source: Arc<dyn ConfigSource>,
  link: Arc<dyn LinkSignal>,
  config: MonitorConfig,
  scheduler: Scheduler,
  cancel: CancellationToken,
  signals: Mutex<Signals>,
  status_tx: watch::Sender<ConnectivityState>,
  listeners: Mutex<BTreeMap<u64, Listener>>,
  next_listener: AtomicU64,
  wake: Notify,
  started: AtomicBool,
}

/// Produces the tri-state connectivity signal.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
  pub fn new(
    gateway: Arc<dyn ApiGateway>,
    config_source: Arc<dyn ConfigSource>,
    link: Arc<dyn LinkSignal>,
    config: MonitorConfig,
    scheduler: Scheduler,
  ) -> Self {
    let link_up = *link.subscribe().borrow();
    // Optimistic until the first probe says otherwise.
    let initial = ConnectivityState::derive(link_up, config_source.api_config().is_some(), true);
    let (status_tx, _rx) = watch::channel(initial);
    let cancel = scheduler.token();

    Self {
      inner: Arc::new(MonitorInner {
        gateway,
        config_source,
        link,
        config,
        scheduler,
        cancel,
        signals: Mutex::new(Signals {
          link_up,
          foreground: true,
          backend_reachable: true,
        }),
        status_tx,
        listeners: Mutex::new(BTreeMap::new()),
        next_listener: AtomicU64::new(0),
        wake: Notify::new(),
        started: AtomicBool::new(false),
      }),
    }
  }

  /// Start the probe driver. Calling this twice is a no-op.
  pub fn start(&self) {
    if self.inner.started.swap(true, Ordering::SeqCst) {
      return;
    }
    let monitor = self.clone();
    self.inner.scheduler.spawn(async move { monitor.run().await });
  }

  /// Stop probing. The last known state holds.
  pub fn stop(&self) {
    self.inner.cancel.cancel();
  }

  async fn run(self) {
    let mut link_rx = self.inner.link.subscribe();
    let mut link_alive = true;

    loop {
      let link_up = *link_rx.borrow_and_update();
      let active = {
        let mut signals = self.inner.signals.lock();
        signals.link_up = link_up;
        signals.link_up && signals.foreground
      };

      if active {
        self.probe().await;
      } else {
        self.update();
      }

      tokio::select! {
        _ = self.inner.cancel.cancelled() => return,
        _ = tokio::time::sleep(self.inner.config.probe_interval), if active => {}
        _ = self.inner.wake.notified() => {}
        changed = link_rx.changed(), if link_alive => {
          if changed.is_err() {
            link_alive = false;
          }
        }
      }
    }
  }

  /// Probe the backend once. Never fails: the outcome only updates the
  /// reachability flag and, through it, the published state.
  pub async fn probe(&self) {
    if self.inner.config_source.api_config().is_none() {
      self.update();
      return;
    }

    let outcome =
      tokio::time::timeout(self.inner.config.probe_timeout, self.inner.gateway.probe()).await;
    let reachable = match outcome {
      Ok(Ok(())) => true,
      Ok(Err(e)) => {
        debug!(error = %e, "Probe failed");
        false
      }
      Err(_) => {
        debug!("Probe timed out");
        false
      }
    };

    self.inner.signals.lock().backend_reachable = reachable;
    self.update();
  }

  /// Recompute the state and notify listeners if it changed.
  fn update(&self) {
    let signals = *self.inner.signals.lock();
    let has_credentials = self.inner.config_source.api_config().is_some();
    let next = ConnectivityState::derive(
      signals.link_up,
      has_credentials,
      signals.backend_reachable,
    );

    let changed = self.inner.status_tx.send_if_modified(|current| {
      if *current == next {
        return false;
      }
      *current = next;
      true
    });
    if !changed {
      return;
    }

    info!(status = next.label(), "Connectivity changed");
    let listeners: Vec<Listener> = self.inner.listeners.lock().values().cloned().collect();
    for listener in listeners {
      listener(next);
    }
  }

  pub fn status(&self) -> ConnectivityState {
    *self.inner.status_tx.borrow()
  }

  /// Receiver for internal consumers that prefer awaiting changes.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.status_tx.subscribe()
  }

  /// Register a change callback. Dropping the returned subscription
  /// unregisters it.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
    self.inner.listeners.lock().insert(id, Arc::new(callback));
    Subscription {
      id,
      monitor: Arc::downgrade(&self.inner),
    }
  }

  /// Foreground/background transition of the surface. Entering the
  /// foreground re-probes immediately; the background suspends probing.
  pub fn set_foreground(&self, foreground: bool) {
    let changed = {
      let mut signals = self.inner.signals.lock();
      let changed = signals.foreground != foreground;
      signals.foreground = foreground;
      changed
    };
    if changed {
      debug!(foreground, "Foreground changed");
      self.inner.wake.notify_one();
    }
  }

  /// Re-evaluate right away, e.g. after settings changed.
  pub fn recheck(&self) {
    self.inner.wake.notify_one();
  }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  monitor: Weak<MonitorInner>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      inner.listeners.lock().remove(&self.id);
    }
  }
}

/// Link signal driven by hand.
#[cfg(test)]
pub struct ManualLink {
  tx: watch::Sender<bool>,
}

#[cfg(test)]
impl ManualLink {
  pub fn new(up: bool) -> Arc<Self> {
    let (tx, _rx) = watch::channel(up);
    Arc::new(Self { tx })
  }

  pub fn set(&self, up: bool) {
    self.tx.send_replace(up);
  }
}

#[cfg(test)]
impl LinkSignal for ManualLink {
  fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{eventually, FakeGateway, StaticConfig};
  use std::sync::atomic::AtomicUsize;

  fn fast_config() -> MonitorConfig {
    MonitorConfig {
      probe_interval: Duration::from_millis(30),
      probe_timeout: Duration::from_millis(20),
    }
  }

  fn monitor(
    gateway: Arc<FakeGateway>,
    config: StaticConfig,
    link: Arc<ManualLink>,
  ) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
      gateway,
      Arc::new(config),
      link,
      fast_config(),
      Scheduler::new(),
    )
  }

  #[test]
  fn test_state_table() {
    use ConnectivityState::*;
    assert_eq!(ConnectivityState::derive(false, true, true), Offline);
    assert_eq!(ConnectivityState::derive(false, false, false), Offline);
    assert_eq!(ConnectivityState::derive(true, false, false), Online);
    assert_eq!(ConnectivityState::derive(true, true, true), Online);
    assert_eq!(ConnectivityState::derive(true, true, false), ServerUnreachable);
  }

  #[tokio::test]
  async fn test_link_down_is_offline_not_unreachable() {
    let gateway = Arc::new(FakeGateway::new());
    let link = ManualLink::new(true);
    let monitor = monitor(gateway, StaticConfig::configured(), link.clone());
    monitor.start();
    assert!(eventually(|| monitor.status() == ConnectivityState::Online).await);

    link.set(false);
    assert!(eventually(|| monitor.status() == ConnectivityState::Offline).await);
  }

  #[tokio::test]
  async fn test_probe_timeout_is_server_unreachable() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.set_probe_delay(Duration::from_millis(200));
    let monitor = monitor(gateway, StaticConfig::configured(), ManualLink::new(true));
    monitor.start();

    assert!(eventually(|| monitor.status() == ConnectivityState::ServerUnreachable).await);
  }

  #[tokio::test]
  async fn test_recovers_when_probe_succeeds_again() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.set_probe_ok(false);
    let monitor = monitor(gateway.clone(), StaticConfig::configured(), ManualLink::new(true));
    monitor.start();
    assert!(eventually(|| monitor.status() == ConnectivityState::ServerUnreachable).await);

    gateway.set_probe_ok(true);
    assert!(eventually(|| monitor.status() == ConnectivityState::Online).await);
  }

  #[tokio::test]
  async fn test_without_credentials_never_probes() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.set_probe_ok(false);
    let monitor = monitor(gateway.clone(), StaticConfig::unconfigured(), ManualLink::new(true));
    monitor.start();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.status(), ConnectivityState::Online);
    assert_eq!(gateway.probe_count(), 0);
  }

  #[tokio::test]
  async fn test_background_suspends_probing() {
    let gateway = Arc::new(FakeGateway::new());
    let monitor = monitor(gateway.clone(), StaticConfig::configured(), ManualLink::new(true));
    monitor.start();
    assert!(eventually(|| gateway.probe_count() >= 2).await);

    monitor.set_foreground(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let suspended_at = gateway.probe_count();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(gateway.probe_count(), suspended_at);

    monitor.set_foreground(true);
    assert!(eventually(|| gateway.probe_count() > suspended_at).await);
  }

  #[tokio::test]
  async fn test_subscribers_see_changes_until_unsubscribed() {
    let gateway = Arc::new(FakeGateway::new());
    let link = ManualLink::new(true);
    let monitor = monitor(gateway, StaticConfig::configured(), link.clone());
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    let subscription = monitor.subscribe(move |state| {
      if state == ConnectivityState::Offline {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });
    monitor.start();

    link.set(false);
    assert!(eventually(|| seen.load(Ordering::SeqCst) == 1).await);

    subscription.unsubscribe();
    link.set(true);
    assert!(eventually(|| monitor.status() == ConnectivityState::Online).await);
    link.set(false);
    assert!(eventually(|| monitor.status() == ConnectivityState::Offline).await);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stop_halts_probing() {
    let gateway = Arc::new(FakeGateway::new());
    let monitor = monitor(gateway.clone(), StaticConfig::configured(), ManualLink::new(true));
    monitor.start();
    assert!(eventually(|| gateway.probe_count() >= 1).await);

    monitor.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stopped_at = gateway.probe_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.probe_count(), stopped_at);
  }
}
