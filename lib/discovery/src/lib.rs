use std::sync::Arc;

use tokio_util::sync::CancellationToken;

mod delay;
mod filter;
mod instancer;

pub use delay::DelayedListener;
pub use filter::Filter;
pub use instancer::{
  DnsInstancer, Instancer, StaticInstancer,
  UPDATE_CHANNEL_CAPACITY, Update,
};

pub use accessor::Instance;

/// One tick of a discovery stream, fanned out to listeners
/// from the monitor task that produced it.
#[derive(Clone, Debug)]
pub struct Event {
  /// The discovery key (service name) this event belongs to.
  pub key: String,
  pub kind: EventKind,
  /// Ordinal of this event within its monitor task, starting
  /// at 1.
  pub event_count: usize,
}

#[derive(Clone, Debug)]
pub enum EventKind {
  /// A fresh instance set, filtered and sorted.
  Instances(Vec<Instance>),
  /// The upstream reported an error for this tick.
  Error(Arc<anyhow::Error>),
  /// The monitor task for this key is exiting.
  Stopped,
}

/// Receives discovery events. Invoked sequentially from the
/// monitor's own task: implementations must not block
/// indefinitely. Wrap with [DelayedListener] when debouncing
/// is needed.
pub trait Listener: Send + Sync {
  fn monitor_event(&self, event: &Event);
}

/// Fan-out over an ordered listener list.
#[derive(Clone, Default)]
pub struct Listeners(Arc<Vec<Arc<dyn Listener>>>);

impl Listeners {
  pub fn new(listeners: Vec<Arc<dyn Listener>>) -> Listeners {
    Listeners(Arc::new(listeners))
  }

  pub fn dispatch(&self, event: &Event) {
    for listener in self.0.iter() {
      listener.monitor_event(event);
    }
  }
}

/// Runs one task per instancer, converting upstream updates
/// into [Event]s for the listener list.
pub struct Monitor {
  stop: CancellationToken,
  stopped: CancellationToken,
  handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Monitor {
  /// Spawn the monitor tasks. `external_closed`, when given,
  /// stops every task as if [Monitor::stop] had been called.
  pub fn start(
    instancers: Vec<Arc<dyn Instancer>>,
    filter: Filter,
    listeners: Listeners,
    external_closed: Option<CancellationToken>,
  ) -> Monitor {
    let stop = CancellationToken::new();
    let stopped = CancellationToken::new();
    let handles = instancers
      .into_iter()
      .map(|instancer| {
        tokio::spawn(run_instancer(
          instancer,
          filter.clone(),
          listeners.clone(),
          stop.clone(),
          stopped.clone(),
          external_closed.clone(),
        ))
      })
      .collect();
    Monitor {
      stop,
      stopped,
      handles,
    }
  }

  /// Ask every monitor task to exit.
  pub fn stop(&self) {
    self.stop.cancel();
  }

  /// Set as soon as any monitor task has exited.
  pub fn stopped(&self) -> CancellationToken {
    self.stopped.clone()
  }

  /// Stop and wait for all monitor tasks to finish.
  pub async fn shutdown(self) {
    self.stop.cancel();
    for handle in self.handles {
      let _ = handle.await;
    }
  }
}

async fn run_instancer(
  instancer: Arc<dyn Instancer>,
  filter: Filter,
  listeners: Listeners,
  stop: CancellationToken,
  stopped: CancellationToken,
  external_closed: Option<CancellationToken>,
) {
  let key = instancer.key().to_string();
  let mut updates = instancer.register();
  let mut event_count = 0;

  loop {
    tokio::select! {
      _ = stop.cancelled() => break,
      _ = closed(&external_closed) => break,
      update = updates.recv() => {
        // A closed update channel means the instancer itself
        // is gone.
        let Some(update) = update else {
          break;
        };
        event_count += 1;
        let kind = match update {
          Ok(instances) => {
            EventKind::Instances(filter.apply(instances))
          }
          Err(e) => {
            warn_update_error(&key, &e);
            EventKind::Error(Arc::new(e))
          }
        };
        listeners.dispatch(&Event {
          key: key.clone(),
          kind,
          event_count,
        });
      }
    }
  }

  // Dropping the receiver deregisters from the instancer.
  drop(updates);
  event_count += 1;
  listeners.dispatch(&Event {
    key,
    kind: EventKind::Stopped,
    event_count,
  });
  stopped.cancel();
}

async fn closed(token: &Option<CancellationToken>) {
  match token {
    Some(token) => token.cancelled().await,
    None => std::future::pending().await,
  }
}

fn warn_update_error(key: &str, e: &anyhow::Error) {
  tracing::warn!("Discovery update failed for {key} | {e:#}");
}

#[cfg(test)]
mod tests {
  use tokio::sync::mpsc;

  use super::*;

  struct Recorder(mpsc::UnboundedSender<Event>);

  impl Listener for Recorder {
    fn monitor_event(&self, event: &Event) {
      let _ = self.0.send(event.clone());
    }
  }

  fn recorder() -> (Listeners, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Listeners::new(vec![Arc::new(Recorder(tx))]), rx)
  }

  #[tokio::test]
  async fn dispatches_filtered_instances() {
    let (listeners, mut rx) = recorder();
    let instancer = Arc::new(StaticInstancer::new(
      "talaria",
      ["https://b:8080", "https://a:8080", "not a url"],
    ));
    let monitor = Monitor::start(
      vec![instancer],
      Filter::default(),
      listeners,
      None,
    );

    let event = rx.recv().await.unwrap();
    assert_eq!(event.key, "talaria");
    assert_eq!(event.event_count, 1);
    let EventKind::Instances(instances) = &event.kind else {
      panic!("expected instances event");
    };
    let instances = instances
      .iter()
      .map(Instance::as_str)
      .collect::<Vec<_>>();
    assert_eq!(instances, ["https://a:8080", "https://b:8080"]);

    monitor.shutdown().await;
  }

  #[tokio::test]
  async fn stop_emits_stopped_and_sets_signal() {
    let (listeners, mut rx) = recorder();
    let instancer =
      Arc::new(StaticInstancer::new("talaria", ["https://a:8080"]));
    let monitor = Monitor::start(
      vec![instancer],
      Filter::default(),
      listeners,
      None,
    );
    let stopped = monitor.stopped();

    // Skip the initial instances event.
    rx.recv().await.unwrap();

    monitor.stop();
    let event = rx.recv().await.unwrap();
    assert!(matches!(event.kind, EventKind::Stopped));
    assert_eq!(event.event_count, 2);
    stopped.cancelled().await;
  }

  #[tokio::test]
  async fn external_closed_stops_the_monitor() {
    let (listeners, mut rx) = recorder();
    let instancer =
      Arc::new(StaticInstancer::new("talaria", ["https://a:8080"]));
    let external = CancellationToken::new();
    let monitor = Monitor::start(
      vec![instancer],
      Filter::default(),
      listeners,
      Some(external.clone()),
    );

    rx.recv().await.unwrap();
    external.cancel();
    let event = rx.recv().await.unwrap();
    assert!(matches!(event.kind, EventKind::Stopped));
    monitor.stopped().cancelled().await;
  }

  #[tokio::test]
  async fn repeated_updates_yield_repeated_dispatch() {
    let (listeners, mut rx) = recorder();
    let instancer = Arc::new(StaticInstancer::new(
      "talaria",
      ["https://a:8080"],
    ));
    let monitor = Monitor::start(
      vec![instancer.clone()],
      Filter::default(),
      listeners,
      None,
    );

    rx.recv().await.unwrap();
    instancer.push(Ok(vec![String::from("https://a:8080")]));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_count, 2);
    assert!(matches!(event.kind, EventKind::Instances(_)));

    monitor.shutdown().await;
  }
}
