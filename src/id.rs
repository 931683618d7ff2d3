use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Longest token accepted from the outside world.
const MAX_ID_LEN: usize = 64;

/// Opaque key naming one stored profile.
///
/// Freshly generated ids are UUID v4 in simple form (32 hex chars), which
/// carries enough entropy that ids cannot be enumerated. Ids coming back
/// from clients are only accepted if they look like something we could
/// have handed out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// A new, never-before-seen identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate an id received in a query string or header.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RequestId::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid request id {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn generated_ids_are_unique_and_parseable() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(RequestId::parse(a.as_str()), Some(a));
    }

    #[test_case("abc123"; "alphanumeric")]
    #[test_case("a-b_C"; "dash and underscore")]
    fn accepts(raw: &str) {
        assert!(RequestId::parse(raw).is_some());
    }

    #[test_case(""; "empty")]
    #[test_case("a,b"; "comma")]
    #[test_case("<script>"; "markup")]
    #[test_case("id with space"; "space")]
    fn rejects(raw: &str) {
        assert!(RequestId::parse(raw).is_none());
    }

    #[test]
    fn rejects_overlong() {
        assert!(RequestId::parse(&"a".repeat(MAX_ID_LEN + 1)).is_none());
    }
}
