use std::{
  net::IpAddr,
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::{Context, anyhow};
use hickory_resolver::TokioResolver;
use tokio::sync::mpsc;

/// Capacity of the channel from an instancer into its monitor
/// task. Kept small: instancers coalesce or block on overflow.
pub const UPDATE_CHANNEL_CAPACITY: usize = 8;

/// One upstream tick: the full instance set, or the error that
/// prevented producing it.
pub type Update = anyhow::Result<Vec<String>>;

/// Emits discovery updates for a single service name.
///
/// Dropping the returned receiver deregisters the
/// subscription.
pub trait Instancer: Send + Sync + 'static {
  fn key(&self) -> &str;
  fn register(&self) -> mpsc::Receiver<Update>;
}

/// An instancer over a fixed list. Emits the list once per
/// registration; further updates can be pushed manually.
pub struct StaticInstancer {
  key: String,
  instances: Vec<String>,
  senders: Mutex<Vec<mpsc::Sender<Update>>>,
}

impl StaticInstancer {
  pub fn new<I, S>(key: impl Into<String>, instances: I) -> StaticInstancer
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    StaticInstancer {
      key: key.into(),
      instances: instances.into_iter().map(Into::into).collect(),
      senders: Mutex::new(Vec::new()),
    }
  }

  /// Deliver an update to every registered subscriber.
  pub fn push(&self, update: Update) {
    let mut senders = self.senders.lock().unwrap();
    senders.retain(|sender| {
      let update = match &update {
        Ok(instances) => Ok(instances.clone()),
        Err(e) => Err(anyhow!("{e:#}")),
      };
      sender.try_send(update).is_ok()
    });
  }
}

impl Instancer for StaticInstancer {
  fn key(&self) -> &str {
    &self.key
  }

  fn register(&self) -> mpsc::Receiver<Update> {
    let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let _ = tx.try_send(Ok(self.instances.clone()));
    self.senders.lock().unwrap().push(tx);
    rx
  }
}

/// Polls A / AAAA records for a service host on an interval,
/// emitting `scheme://addr:port` instance urls whenever the
/// resolved set changes.
pub struct DnsInstancer {
  key: String,
  host: String,
  port: u16,
  scheme: String,
  interval: Duration,
  resolver: Arc<TokioResolver>,
}

impl DnsInstancer {
  pub fn new(
    key: impl Into<String>,
    host: impl Into<String>,
    port: u16,
    scheme: impl Into<String>,
    interval: Duration,
  ) -> anyhow::Result<DnsInstancer> {
    let resolver = TokioResolver::builder_tokio()
      .context("Failed to load system resolver configuration")?
      .build();
    Ok(DnsInstancer {
      key: key.into(),
      host: host.into(),
      port,
      scheme: scheme.into(),
      interval,
      resolver: Arc::new(resolver),
    })
  }
}

impl Instancer for DnsInstancer {
  fn key(&self) -> &str {
    &self.key
  }

  fn register(&self) -> mpsc::Receiver<Update> {
    let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let host = self.host.clone();
    let scheme = self.scheme.clone();
    let port = self.port;
    let interval = self.interval;
    let resolver = self.resolver.clone();

    tokio::spawn(async move {
      let mut last: Option<Vec<String>> = None;
      loop {
        let update = match resolver.lookup_ip(host.as_str()).await {
          Ok(lookup) => {
            let mut instances = lookup
              .iter()
              .map(|ip| instance_url(&scheme, ip, port))
              .collect::<Vec<_>>();
            instances.sort();
            instances.dedup();
            if last.as_ref() == Some(&instances) {
              None
            } else {
              last = Some(instances.clone());
              Some(Ok(instances))
            }
          }
          Err(e) => Some(Err(anyhow::Error::new(e).context(
            format!("DNS lookup failed for {host}"),
          ))),
        };
        if let Some(update) = update
          && tx.send(update).await.is_err()
        {
          // Receiver dropped: deregistered.
          return;
        }
        tokio::time::sleep(interval).await;
      }
    });

    rx
  }
}

fn instance_url(scheme: &str, ip: IpAddr, port: u16) -> String {
  match ip {
    IpAddr::V4(ip) => format!("{scheme}://{ip}:{port}"),
    IpAddr::V6(ip) => format!("{scheme}://[{ip}]:{port}"),
  }
}

#[cfg(test)]
mod tests {
  use std::net::{Ipv4Addr, Ipv6Addr};

  use super::*;

  #[test]
  fn instance_urls_bracket_ipv6() {
    assert_eq!(
      instance_url(
        "https",
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        8080
      ),
      "https://10.0.0.1:8080"
    );
    assert_eq!(
      instance_url(
        "https",
        IpAddr::V6(Ipv6Addr::LOCALHOST),
        8080
      ),
      "https://[::1]:8080"
    );
  }

  #[tokio::test]
  async fn static_instancer_emits_on_register() {
    let instancer =
      StaticInstancer::new("talaria", ["https://a:8080"]);
    let mut rx = instancer.register();
    let update = rx.recv().await.unwrap().unwrap();
    assert_eq!(update, ["https://a:8080"]);
  }

  #[tokio::test]
  async fn push_drops_closed_subscribers() {
    let instancer =
      StaticInstancer::new("talaria", ["https://a:8080"]);
    let rx = instancer.register();
    drop(rx);
    instancer.push(Ok(vec![String::from("https://b:8080")]));
    let mut rx = instancer.register();
    rx.recv().await.unwrap().unwrap();
    instancer.push(Ok(vec![String::from("https://c:8080")]));
    let update = rx.recv().await.unwrap().unwrap();
    assert_eq!(update, ["https://c:8080"]);
  }
}
