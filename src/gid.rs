//! Globally unique, time-ordered identifiers.
//!
//! A [`Gid`] is 20 bytes: an 8-byte big-endian millisecond timestamp, a
//! 4-byte big-endian per-millisecond counter and 8 random salt bytes.
//! Byte order equals logical order, so the derived `Ord` compares the
//! timestamp first, then the counter.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const GID_LEN: usize = 20;

const TS_LEN: usize = 8;
const COUNTER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GidError {
    #[error("expected {GID_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("expected 40 hex chars, got {0}")]
    InvalidHexLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid decimal digit {0:?}")]
    InvalidDecimal(char),

    #[error("empty decimal string")]
    EmptyDecimal,

    #[error("decimal value exceeds 160 bits")]
    DecimalOverflow,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gid([u8; GID_LEN]);

impl Gid {
    pub fn from_parts(timestamp: u64, counter: u32, salt: [u8; 8]) -> Self {
        let mut b = [0u8; GID_LEN];
        b[..TS_LEN].copy_from_slice(&timestamp.to_be_bytes());
        b[TS_LEN..TS_LEN + COUNTER_LEN].copy_from_slice(&counter.to_be_bytes());
        b[TS_LEN + COUNTER_LEN..].copy_from_slice(&salt);
        Self(b)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GidError> {
        let arr: [u8; GID_LEN] = bytes
            .try_into()
            .map_err(|_| GidError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; GID_LEN] {
        &self.0
    }

    /// Milliseconds since the Unix epoch at generation time.
    pub fn timestamp(&self) -> u64 {
        let mut b = [0u8; TS_LEN];
        b.copy_from_slice(&self.0[..TS_LEN]);
        u64::from_be_bytes(b)
    }

    pub fn counter(&self) -> u32 {
        let mut b = [0u8; COUNTER_LEN];
        b.copy_from_slice(&self.0[TS_LEN..TS_LEN + COUNTER_LEN]);
        u32::from_be_bytes(b)
    }

    pub fn salt(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[TS_LEN + COUNTER_LEN..]);
        b
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, GidError> {
        if s.len() != GID_LEN * 2 {
            return Err(GidError::InvalidHexLength(s.len()));
        }
        let raw = hex::decode(s).map_err(|e| GidError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&raw)
    }

    /// The 20 bytes read as one unsigned 160-bit big-endian integer.
    pub fn to_decimal(&self) -> String {
        let mut n = self.0;
        if n.iter().all(|&b| b == 0) {
            return "0".to_string();
        }

        let mut digits = Vec::with_capacity(49);
        while n.iter().any(|&b| b != 0) {
            // long division of the whole number by 10
            let mut rem: u32 = 0;
            for byte in n.iter_mut() {
                let cur = (rem << 8) | *byte as u32;
                *byte = (cur / 10) as u8;
                rem = cur % 10;
            }
            digits.push(b'0' + rem as u8);
        }
        digits.reverse();
        String::from_utf8_lossy(&digits).into_owned()
    }

    pub fn from_decimal(s: &str) -> Result<Self, GidError> {
        if s.is_empty() {
            return Err(GidError::EmptyDecimal);
        }

        let mut n = [0u8; GID_LEN];
        for c in s.chars() {
            let digit = c.to_digit(10).ok_or(GidError::InvalidDecimal(c))?;
            // n = n * 10 + digit, least significant byte last
            let mut carry = digit;
            for byte in n.iter_mut().rev() {
                let cur = *byte as u32 * 10 + carry;
                *byte = (cur & 0xFF) as u8;
                carry = cur >> 8;
            }
            if carry != 0 {
                return Err(GidError::DecimalOverflow);
            }
        }
        Ok(Self(n))
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self.to_hex())
    }
}

impl FromStr for Gid {
    type Err = GidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Gid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Gid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Gid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

struct ClockState {
    last_ms: u64,
    counter: u32,
}

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

/// Produces [`Gid`]s that are unique per generator instance.
///
/// The timestamp/counter pair is only touched inside one mutex. When the
/// wall clock goes backwards the last timestamp is kept. When the counter
/// is exhausted within one millisecond the generator moves its logical
/// timestamp one millisecond ahead, so ids stay unique and ordered.
pub struct GidGenerator {
    state: Mutex<ClockState>,
    clock: Clock,
}

impl GidGenerator {
    pub fn new() -> Self {
        Self::with_clock(now_ms)
    }

    pub fn with_clock<F>(clock: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(ClockState { last_ms: 0, counter: 0 }),
            clock: Box::new(clock),
        }
    }

    pub fn generate(&self) -> Gid {
        let now = (self.clock)();
        let (ts, counter) = {
            // The pair is always written together, so a poisoned lock still
            // holds a consistent value.
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if now > st.last_ms {
                st.last_ms = now;
                st.counter = 0;
            } else if st.counter == u32::MAX {
                st.last_ms += 1;
                st.counter = 0;
                tracing::warn!("[gid] [counter_exhausted] advancing to ts={}", st.last_ms);
            } else {
                st.counter += 1;
            }
            (st.last_ms, st.counter)
        };

        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);
        Gid::from_parts(ts, counter, salt)
    }
}

impl Default for GidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_ids_are_distinct() {
        let gen = Arc::new(GidGenerator::new());
        let mut all = HashSet::with_capacity(100_000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = Arc::clone(&gen);
                std::thread::spawn(move || (0..12_500).map(|_| g.generate()).collect::<Vec<_>>())
            })
            .collect();

        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(all.len(), 100_000);
    }

    #[test]
    fn test_ordering_timestamp_then_counter() {
        let a = Gid::from_parts(10, 500, [0xFF; 8]);
        let b = Gid::from_parts(11, 0, [0x00; 8]);
        assert!(a < b);

        let c = Gid::from_parts(11, 1, [0x00; 8]);
        assert!(b < c);
    }

    #[test]
    fn test_same_millisecond_increments_counter() {
        let gen = GidGenerator::with_clock(|| 42);
        let a = gen.generate();
        let b = gen.generate();
        assert_eq!(a.timestamp(), 42);
        assert_eq!(a.counter(), 0);
        assert_eq!(b.counter(), 1);
        assert!(a < b);
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let t = Arc::new(AtomicU64::new(1000));
        let t2 = Arc::clone(&t);
        let gen = GidGenerator::with_clock(move || t2.load(Ordering::SeqCst));

        let a = gen.generate();
        t.store(900, Ordering::SeqCst);
        let b = gen.generate();
        assert_eq!(b.timestamp(), 1000);
        assert!(a < b);
    }

    #[test]
    fn test_counter_exhaustion_advances_timestamp() {
        let gen = GidGenerator::with_clock(|| 7);
        let _ = gen.generate();
        gen.state.lock().unwrap().counter = u32::MAX;

        let next = gen.generate();
        assert_eq!(next.timestamp(), 8);
        assert_eq!(next.counter(), 0);
    }

    #[test]
    fn test_round_trips() {
        let gen = GidGenerator::new();
        for _ in 0..64 {
            let g = gen.generate();
            assert_eq!(Gid::from_hex(&g.to_hex()).unwrap(), g);
            assert_eq!(Gid::from_decimal(&g.to_decimal()).unwrap(), g);
            assert_eq!(Gid::from_bytes(g.as_bytes()).unwrap(), g);
        }
    }

    #[test]
    fn test_parts_are_recoverable() {
        let g = Gid::from_parts(1_700_000_000_000, 42, [9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(g.timestamp(), 1_700_000_000_000);
        assert_eq!(g.counter(), 42);
        assert_eq!(g.salt(), [9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn test_decimal_known_values() {
        let zero = Gid::from_bytes(&[0u8; 20]).unwrap();
        assert_eq!(zero.to_decimal(), "0");

        let mut one = [0u8; 20];
        one[19] = 1;
        assert_eq!(Gid::from_bytes(&one).unwrap().to_decimal(), "1");

        // high bit set must still be non-negative
        let max = Gid::from_bytes(&[0xFF; 20]).unwrap();
        assert_eq!(
            max.to_decimal(),
            "1461501637330902918203684832716283019655932542975"
        );
        assert_eq!(Gid::from_decimal(&max.to_decimal()).unwrap(), max);
    }

    #[test]
    fn test_decimal_rejects_overflow_and_garbage() {
        assert_eq!(
            Gid::from_decimal("1461501637330902918203684832716283019655932542976"),
            Err(GidError::DecimalOverflow)
        );
        assert_eq!(Gid::from_decimal("12a"), Err(GidError::InvalidDecimal('a')));
        assert_eq!(Gid::from_decimal(""), Err(GidError::EmptyDecimal));
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert!(matches!(Gid::from_hex("abcd"), Err(GidError::InvalidHexLength(4))));
        assert!(matches!(Gid::from_hex(&"zz".repeat(20)), Err(GidError::InvalidHex(_))));
        assert!(matches!(Gid::from_bytes(&[1, 2, 3]), Err(GidError::InvalidLength(3))));
    }

    #[test]
    fn test_serde_uses_hex() {
        let g = Gid::from_parts(1, 2, [3; 8]);
        let json = serde_json::to_string(&g).unwrap();
        assert_eq!(json, format!("\"{}\"", g.to_hex()));
        let back: Gid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }
}
