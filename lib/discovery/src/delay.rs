use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{Event, Listener};

/// Debounces events through a capacitor: every submission
/// resets the delay, and only the latest event fires once the
/// delay elapses. Used to smooth noisy discovery sources.
///
/// Submissions never block; intermediate events are simply
/// superseded.
pub struct DelayedListener {
  capacitor: watch::Sender<Option<Event>>,
}

impl DelayedListener {
  pub fn new(
    delay: Duration,
    inner: Arc<dyn Listener>,
  ) -> DelayedListener {
    let (capacitor, mut charge) = watch::channel(None);

    tokio::spawn(async move {
      loop {
        // Wait for a submission to charge the capacitor.
        if charge.changed().await.is_err() {
          return;
        }
        // Each further submission resets the delay.
        loop {
          let sleep = tokio::time::sleep(delay);
          tokio::pin!(sleep);
          tokio::select! {
            changed = charge.changed() => {
              if changed.is_err() {
                return;
              }
            }
            _ = &mut sleep => break,
          }
        }
        let event = charge.borrow_and_update().clone();
        if let Some(event) = event {
          inner.monitor_event(&event);
        }
      }
    });

    DelayedListener { capacitor }
  }
}

impl Listener for DelayedListener {
  fn monitor_event(&self, event: &Event) {
    let _ = self.capacitor.send(Some(event.clone()));
  }
}
