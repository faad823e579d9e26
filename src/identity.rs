use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const PREFIX: &str = "tab";
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque per-instance tab identifier: `tab_<base36 millis>_<base36 random>`.
///
/// Generated once per tab and never reused. Uniqueness is probabilistic: the
/// timestamp separates tabs opened at different milliseconds and 64 random
/// bits separate tabs opened in the same one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

/// Why the secure random source could not be used.
#[derive(Debug)]
pub struct RandomSourceError(String);

impl fmt::Display for RandomSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "random source unavailable: {}", self.0)
    }
}

impl TabId {
    /// Generate a fresh id, preferring OS-backed CSPRNG entropy.
    pub fn generate() -> Self {
        Self::generate_with(unix_millis(), |bytes| {
            getrandom::fill(bytes).map_err(|e| RandomSourceError(e.to_string()))
        })
    }

    /// Test hook: inject the timestamp and the random source.
    ///
    /// A failing random source falls back to a time/counter mix rather than
    /// erroring; identity generation never fails.
    pub(crate) fn generate_with<F>(millis: u64, mut fill_random: F) -> Self
    where
        F: FnMut(&mut [u8]) -> std::result::Result<(), RandomSourceError>,
    {
        let mut bytes = [0_u8; std::mem::size_of::<u64>()];
        let random = match fill_random(&mut bytes) {
            Ok(()) => u64::from_be_bytes(bytes),
            Err(err) => {
                log::debug!("{err}; using weak fallback for tab id");
                weak_random()
            }
        };
        Self(format!("{PREFIX}_{}_{}", base36(millis), base36(random)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TabId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<TabId> for String {
    fn from(value: TabId) -> Self {
        value.0
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for TabId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TabId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Non-cryptographic fallback: splitmix64 over nanos, pid and a counter.
fn weak_random() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut z = nanos
        ^ (u64::from(std::process::id()) << 32)
        ^ COUNTER.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub(crate) fn base36(mut value: u64) -> String {
    if value == 0 {
        return "0".into();
    }
    let mut digits = Vec::with_capacity(13);
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn base36_matches_known_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = TabId::generate_with(36, |bytes| {
            bytes.copy_from_slice(&35_u64.to_be_bytes());
            Ok(())
        });
        assert_eq!(id.as_str(), "tab_10_z");
    }

    #[test]
    fn thousand_ids_are_distinct() {
        let ids: HashSet<TabId> = (0..1000).map(|_| TabId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn failing_random_source_falls_back() {
        let ids: HashSet<TabId> = (0..1000)
            .map(|_| {
                TabId::generate_with(42, |_| Err(RandomSourceError("disabled".into())))
            })
            .collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.as_str().starts_with("tab_16_")));
    }
}
