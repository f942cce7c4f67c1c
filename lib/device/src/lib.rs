use std::fmt;

use anyhow::anyhow;

/// A canonical device identifier, `scheme:authority`.
///
/// Equal devices always canonicalise to the same id, so the
/// id is safe to use as a consistent-hash key: `MAC:11-22-...`
/// and `mac:1122...` route to the same back-end.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

const MAC_SEPARATORS: [char; 3] = [':', '-', '.'];
const MAC_LENGTH: usize = 12;

impl DeviceId {
  /// Parse and canonicalise a raw device name.
  ///
  /// `mac` authorities are lowercased, separator-stripped hex
  /// of exactly 12 digits. `uuid`, `dns`, and `serial`
  /// authorities are passed through with a lowercased scheme.
  /// A bare authority without a scheme is treated as a mac.
  pub fn parse(raw: &str) -> anyhow::Result<DeviceId> {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(anyhow!("Empty device id"));
    }
    let (scheme, authority) = match raw.split_once(':') {
      Some((scheme, authority)) => {
        (scheme.to_ascii_lowercase(), authority)
      }
      None => (String::from("mac"), raw),
    };
    match scheme.as_str() {
      "mac" => {
        let mac = authority
          .chars()
          .filter(|c| !MAC_SEPARATORS.contains(c))
          .map(|c| c.to_ascii_lowercase())
          .collect::<String>();
        if mac.len() != MAC_LENGTH
          || !mac.chars().all(|c| c.is_ascii_hexdigit())
        {
          return Err(anyhow!(
            "Invalid mac device id: {raw}"
          ));
        }
        Ok(DeviceId(format!("mac:{mac}")))
      }
      "uuid" | "dns" | "serial" => {
        if authority.is_empty() {
          return Err(anyhow!(
            "Device id has an empty authority: {raw}"
          ));
        }
        Ok(DeviceId(format!("{scheme}:{authority}")))
      }
      _ => Err(anyhow!(
        "Unrecognized device id scheme '{scheme}': {raw}"
      )),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The canonical bytes, as fed to the hash ring.
  pub fn as_bytes(&self) -> &[u8] {
    self.0.as_bytes()
  }
}

impl fmt::Display for DeviceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mac_ids_canonicalise_separators_and_case() {
    for raw in [
      "mac:112233AABBCC",
      "MAC:11:22:33:aa:bb:cc",
      "mac:11-22-33-AA-BB-CC",
      "mac:1122.33aa.bbcc",
      "112233aabbcc",
    ] {
      assert_eq!(
        DeviceId::parse(raw).unwrap().as_str(),
        "mac:112233aabbcc",
        "raw: {raw}"
      );
    }
  }

  #[test]
  fn invalid_macs_are_rejected() {
    for raw in [
      "mac:11223344556",
      "mac:112233445566778",
      "mac:11223344556g",
      "mac:",
      "",
    ] {
      assert!(DeviceId::parse(raw).is_err(), "raw: {raw}");
    }
  }

  #[test]
  fn other_schemes_pass_through() {
    assert_eq!(
      DeviceId::parse("uuid:f81d4fae-7dec-11d0-a765-00a0c91e6bf6")
        .unwrap()
        .as_str(),
      "uuid:f81d4fae-7dec-11d0-a765-00a0c91e6bf6"
    );
    assert_eq!(
      DeviceId::parse("DNS:talaria.example.net")
        .unwrap()
        .as_str(),
      "dns:talaria.example.net"
    );
    assert_eq!(
      DeviceId::parse("serial:ABC123").unwrap().as_str(),
      "serial:ABC123"
    );
  }

  #[test]
  fn unknown_schemes_are_rejected() {
    assert!(DeviceId::parse("ipv4:10.0.0.1").is_err());
  }

  #[test]
  fn equivalent_ids_share_hash_bytes() {
    let left = DeviceId::parse("MAC:11-22-33-44-55-66").unwrap();
    let right = DeviceId::parse("mac:112233445566").unwrap();
    assert_eq!(left.as_bytes(), right.as_bytes());
  }
}
