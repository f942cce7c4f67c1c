use anyhow::Context;
use axum::http::{HeaderMap, HeaderName};

/// An ordered set of canonicalised header names, used to
/// project headers between inbound, child, and outbound
/// messages.
///
/// Constructed once from configuration, read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct HeaderSet(Vec<HeaderName>);

impl HeaderSet {
  /// Canonicalises each name on insertion. Duplicates are
  /// allowed and harmless.
  pub fn new<I, S>(names: I) -> anyhow::Result<HeaderSet>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let names = names
      .into_iter()
      .map(|name| {
        let name = name.as_ref();
        HeaderName::from_bytes(name.as_bytes())
          .with_context(|| format!("Invalid header name: {name}"))
      })
      .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(HeaderSet(names))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn names(&self) -> &[HeaderName] {
    &self.0
  }

  /// Copy from `source` into `target` only the entries whose
  /// names are in the set.
  ///
  /// Additive only: entries already in `target` are never
  /// altered, so the copy is idempotent in `source`. An empty
  /// set is a no-op.
  pub fn filter(&self, target: &mut HeaderMap, source: &HeaderMap) {
    for name in &self.0 {
      if target.contains_key(name) {
        continue;
      }
      for value in source.get_all(name) {
        target.append(name.clone(), value.clone());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use axum::http::HeaderValue;

  use super::*;

  fn headers(entries: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in entries {
      map.append(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_static(value),
      );
    }
    map
  }

  #[test]
  fn canonicalises_names() {
    let set = HeaderSet::new(["Content-Type", "X-Device-Name"])
      .unwrap();
    assert_eq!(set.names()[0].as_str(), "content-type");
    assert_eq!(set.names()[1].as_str(), "x-device-name");
  }

  #[test]
  fn rejects_invalid_names() {
    assert!(HeaderSet::new(["bad name"]).is_err());
  }

  #[test]
  fn copies_only_named_entries() {
    let set = HeaderSet::new(["x-a"]).unwrap();
    let source = headers(&[("x-a", "1"), ("x-b", "2")]);
    let mut target = HeaderMap::new();
    set.filter(&mut target, &source);
    assert_eq!(target.get("x-a").unwrap(), "1");
    assert!(target.get("x-b").is_none());
  }

  #[test]
  fn empty_set_is_noop() {
    let set = HeaderSet::default();
    let source = headers(&[("x-a", "1")]);
    let mut target = headers(&[("x-b", "2")]);
    set.filter(&mut target, &source);
    assert_eq!(target.len(), 1);
    assert_eq!(target.get("x-b").unwrap(), "2");
  }

  #[test]
  fn preserves_existing_target_entries() {
    let set = HeaderSet::new(["x-a", "x-b"]).unwrap();
    let source = headers(&[("x-a", "new"), ("x-b", "2")]);
    let mut target = headers(&[("x-a", "old")]);
    set.filter(&mut target, &source);
    assert_eq!(target.get("x-a").unwrap(), "old");
    assert_eq!(target.get("x-b").unwrap(), "2");
  }

  #[test]
  fn filter_is_idempotent_in_source() {
    let set = HeaderSet::new(["x-a"]).unwrap();
    let source = headers(&[("x-a", "1"), ("x-a", "2")]);
    let mut once = HeaderMap::new();
    set.filter(&mut once, &source);
    let mut twice = HeaderMap::new();
    set.filter(&mut twice, &source);
    set.filter(&mut twice, &source);
    assert_eq!(once, twice);
    assert_eq!(
      once.get_all("x-a").iter().count(),
      2
    );
  }
}
