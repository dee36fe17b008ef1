//! Client SDK capability detection

use std::cmp::Ordering;
use std::fmt;

/// SDK identifier sent by a client, e.g. `js1.9.0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSdk {
    pub sdk: String,
    pub version: String,
}

impl ClientSdk {
    /// Split `js1.9.0` into `js` and `1.9.0`
    pub fn parse(identifier: &str) -> Option<Self> {
        let split = identifier.find(|c: char| c.is_ascii_digit())?;
        let (sdk, version) = identifier.split_at(split);
        if sdk.is_empty() {
            return None;
        }
        Some(Self {
            sdk: sdk.to_string(),
            version: version.to_string(),
        })
    }

    /// Whether the client understands `{__op: "Delete"}` in responses
    pub fn supports_forward_delete(&self) -> bool {
        self.sdk == "js" && compare_versions(&self.version, "1.9.0") != Ordering::Less
    }
}

impl fmt::Display for ClientSdk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.sdk, self.version)
    }
}

/// Compare dotted numeric versions; missing parts count as zero
fn compare_versions(left: &str, right: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (left, right) = (parts(left), parts(right));
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}
