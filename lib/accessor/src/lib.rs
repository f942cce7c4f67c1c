use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, anyhow};
use sha2::{Digest, Sha256};
use url::Url;

/// Virtual nodes per instance on the default ring.
pub const DEFAULT_VNODES: usize = 211;

/// A validated back-end instance: scheme + host + optional
/// port, no query string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instance(String);

impl Instance {
  pub fn parse(raw: &str) -> anyhow::Result<Instance> {
    let url = Url::parse(raw)
      .with_context(|| format!("Invalid instance url: {raw}"))?;
    if url.host_str().is_none() {
      return Err(anyhow!("Instance url has no host: {raw}"));
    }
    if url.query().is_some() {
      return Err(anyhow!(
        "Instance url must not carry a query string: {raw}"
      ));
    }
    Ok(Instance(raw.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Instance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Maps a hash key to one instance of a set.
///
/// For the same instance set, the same key always maps to the
/// same instance. Errors iff the instance set is empty.
pub trait Accessor: Send + Sync {
  fn get(&self, key: &[u8]) -> anyhow::Result<&str>;
}

/// Builds an [Accessor] from an instance slice. Passed
/// explicitly wherever accessors are (re)built, never read
/// from package state.
pub type AccessorFactory =
  Arc<dyn Fn(&[Instance]) -> Arc<dyn Accessor> + Send + Sync>;

/// The default factory: a consistent-hash ring with
/// [DEFAULT_VNODES] virtual nodes per instance.
pub fn ring_factory() -> AccessorFactory {
  Arc::new(|instances| Arc::new(HashRing::new(instances, DEFAULT_VNODES)))
}

/// Consistent-hash ring over a fixed instance set.
///
/// Built atomically from an instance slice and immutable
/// thereafter; discovery updates replace the whole ring.
pub struct HashRing {
  points: BTreeMap<u64, usize>,
  instances: Vec<Instance>,
}

impl HashRing {
  pub fn new(instances: &[Instance], vnodes: usize) -> HashRing {
    // Order independence: the ring for {a, b} must equal the
    // ring for {b, a}.
    let mut instances = instances.to_vec();
    instances.sort();
    instances.dedup();

    let mut points = BTreeMap::new();
    for (index, instance) in instances.iter().enumerate() {
      for vnode in 0..vnodes.max(1) {
        let point =
          ring_point(format!("{instance}#{vnode}").as_bytes());
        points.insert(point, index);
      }
    }
    HashRing { points, instances }
  }

  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }
}

impl Accessor for HashRing {
  fn get(&self, key: &[u8]) -> anyhow::Result<&str> {
    if self.points.is_empty() {
      return Err(anyhow!("No instances on hash ring"));
    }
    let point = ring_point(key);
    let index = self
      .points
      .range(point..)
      .next()
      .or_else(|| self.points.iter().next())
      .map(|(_, index)| *index)
      .expect("non-empty ring always yields a point");
    Ok(self.instances[index].as_str())
  }
}

fn ring_point(bytes: &[u8]) -> u64 {
  let digest = Sha256::digest(bytes);
  u64::from_be_bytes(
    digest[..8].try_into().expect("sha256 digest is 32 bytes"),
  )
}
