use accessor::Instance;

/// Normalises raw discovery strings into [Instance]s.
///
/// Malformed entries are dropped with a warning. Output is
/// sorted and de-duplicated so equivalent sets compare equal.
#[derive(Clone, Debug, Default)]
pub struct Filter {
  default_scheme: Option<String>,
}

impl Filter {
  /// A filter that prefixes scheme-less entries with
  /// `default_scheme` instead of rejecting them.
  pub fn with_default_scheme(
    default_scheme: impl Into<String>,
  ) -> Filter {
    Filter {
      default_scheme: Some(default_scheme.into()),
    }
  }

  pub fn apply(&self, raw: Vec<String>) -> Vec<Instance> {
    let mut instances = raw
      .into_iter()
      .filter_map(|raw| {
        let candidate = if raw.contains("://") {
          raw
        } else {
          match &self.default_scheme {
            Some(scheme) => format!("{scheme}://{raw}"),
            None => {
              tracing::warn!(
                "Dropping discovered instance without scheme: {raw}"
              );
              return None;
            }
          }
        };
        Instance::parse(&candidate)
          .inspect_err(|e| {
            tracing::warn!(
              "Dropping malformed discovered instance | {e:#}"
            )
          })
          .ok()
      })
      .collect::<Vec<_>>();
    instances.sort();
    instances.dedup();
    instances
  }
}
