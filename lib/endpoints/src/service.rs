use std::{
  collections::BTreeMap,
  sync::{Arc, RwLock},
};

use accessor::{Accessor, AccessorFactory};
use anyhow::anyhow;
use discovery::{Event, EventKind, Listener};
use url::Url;

use crate::{Endpoints, KeyFunc, RequestState, apply_request_parts};

/// A resolver driven by service discovery: one [Accessor] per
/// discovery key, each replaced wholesale on every instances
/// event.
///
/// The monitor pushes events in; this resolver holds no
/// reference back to the monitor.
pub struct ServiceEndpoints {
  key_func: KeyFunc,
  factory: AccessorFactory,
  accessors: RwLock<BTreeMap<String, Arc<dyn Accessor>>>,
}

impl ServiceEndpoints {
  pub fn new(
    key_func: KeyFunc,
    factory: AccessorFactory,
  ) -> ServiceEndpoints {
    ServiceEndpoints {
      key_func,
      factory,
      accessors: RwLock::new(BTreeMap::new()),
    }
  }

  /// Discovery keys currently holding an accessor.
  pub fn keys(&self) -> Vec<String> {
    self.accessors.read().unwrap().keys().cloned().collect()
  }
}

impl Endpoints for ServiceEndpoints {
  fn fanout_urls(
    &self,
    request: &RequestState,
  ) -> anyhow::Result<Vec<Url>> {
    let key = (self.key_func)(request)?;

    let mut urls = Vec::new();
    {
      let accessors = self.accessors.read().unwrap();
      for accessor in accessors.values() {
        // Empty rings are skipped, not fatal.
        let Ok(instance) = accessor.get(&key) else {
          continue;
        };
        match Url::parse(instance) {
          Ok(url) => urls.push(url),
          Err(e) => tracing::warn!(
            "Discovered instance is not a valid url: {instance} | {e:?}"
          ),
        }
      }
    }

    if urls.is_empty() {
      return Err(anyhow!(
        "No back-end instances own the requested key"
      ));
    }
    for url in &mut urls {
      apply_request_parts(url, request);
    }
    Ok(urls)
  }
}

impl Listener for ServiceEndpoints {
  fn monitor_event(&self, event: &Event) {
    match &event.kind {
      EventKind::Instances(instances) => {
        // Build outside the lock, replace wholesale under it.
        // In-flight readers keep the accessor they already
        // cloned.
        let accessor = (self.factory)(instances);
        self
          .accessors
          .write()
          .unwrap()
          .insert(event.key.clone(), accessor);
      }
      EventKind::Error(e) => {
        tracing::warn!(
          "Keeping last accessor for {} after discovery error | {e:#}",
          event.key
        );
      }
      EventKind::Stopped => {
        self.accessors.write().unwrap().remove(&event.key);
      }
    }
  }
}
