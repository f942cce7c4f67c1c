use url::Url;

use crate::{Endpoints, RequestState, apply_request_parts, parse_base};

/// A resolver over a static base-url list. Immutable after
/// construction.
#[derive(Clone, Debug)]
pub struct FixedEndpoints {
  bases: Vec<Url>,
}

impl FixedEndpoints {
  /// Each base requires a scheme and host and must not carry a
  /// query string.
  pub fn new<I, S>(raw: I) -> anyhow::Result<FixedEndpoints>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let bases = raw
      .into_iter()
      .map(|raw| parse_base(raw.as_ref()))
      .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(FixedEndpoints { bases })
  }

  pub fn len(&self) -> usize {
    self.bases.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bases.is_empty()
  }
}

impl Endpoints for FixedEndpoints {
  fn fanout_urls(
    &self,
    request: &RequestState,
  ) -> anyhow::Result<Vec<Url>> {
    let mut urls = self.bases.clone();
    for url in &mut urls {
      apply_request_parts(url, request);
    }
    Ok(urls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::request;

  #[test]
  fn rejects_query_strings_and_missing_schemes() {
    assert!(FixedEndpoints::new(["http://a:8080?x=1"]).is_err());
    assert!(FixedEndpoints::new(["a:8080"]).is_err());
    assert!(FixedEndpoints::new(["http://a:8080"]).is_ok());
  }

  #[test]
  fn copies_path_and_query_onto_each_base() {
    let fixed =
      FixedEndpoints::new(["http://a:8080", "http://b:8080"])
        .unwrap();
    let urls = fixed
      .fanout_urls(&request("/api/device?limit=2"))
      .unwrap();
    assert_eq!(
      urls.iter().map(Url::as_str).collect::<Vec<_>>(),
      [
        "http://a:8080/api/device?limit=2",
        "http://b:8080/api/device?limit=2",
      ]
    );
  }

  #[test]
  fn empty_configuration_yields_empty_urls() {
    let fixed = FixedEndpoints::new(Vec::<String>::new()).unwrap();
    assert!(fixed.fanout_urls(&request("/x")).unwrap().is_empty());
  }
}
