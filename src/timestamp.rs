use std::cmp;
use std::fmt;
use std::time::SystemTime;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_NANOSEC: u32 = 999_999_999;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A msgpack timestamp: seconds and nanoseconds relative to the UNIX epoch,
/// ignoring leap seconds.
///
/// On the wire this is the msgpack-reserved extension type `-1`, encoded in
/// the smallest of its three forms that can hold the value: 32-bit seconds,
/// 30-bit nanoseconds packed with 34-bit seconds, or the full 96-bit form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

impl Timestamp {
    /// Construct a new timestamp. Fails if nanoseconds is one billion or more.
    pub fn new(secs: i64, nanos: u32) -> Option<Self> {
        if nanos > MAX_NANOSEC {
            return None;
        }
        Some(Self { secs, nanos })
    }

    /// Construct a timestamp from whole seconds.
    pub fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// The current time, to nanosecond precision.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                let mut secs = -(d.as_secs() as i64);
                let mut nanos = d.subsec_nanos();
                if nanos > 0 {
                    secs -= 1;
                    nanos = NANOS_PER_SEC as u32 - nanos;
                }
                Self { secs, nanos }
            }
        }
    }

    /// Whole seconds since the UNIX epoch.
    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// The fractional part, in nanoseconds.
    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Size of the wire payload this timestamp will use: 4, 8, or 12 bytes.
    pub fn size(&self) -> usize {
        if self.secs >= 0 && (self.secs >> 34) == 0 {
            if self.nanos == 0 && self.secs <= u32::MAX as i64 {
                4
            } else {
                8
            }
        } else {
            12
        }
    }

    /// Append the extension payload (not the marker or type code) to a byte
    /// vector, using the form reported by [`size`][Self::size].
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        match self.size() {
            4 => buf.extend_from_slice(&(self.secs as u32).to_be_bytes()),
            8 => {
                let packed = ((self.nanos as u64) << 34) | (self.secs as u64);
                buf.extend_from_slice(&packed.to_be_bytes());
            }
            _ => {
                buf.extend_from_slice(&self.nanos.to_be_bytes());
                buf.extend_from_slice(&self.secs.to_be_bytes());
            }
        }
    }

    /// Decode a timestamp extension payload. The payload length selects the
    /// wire form; anything but 4, 8, or 12 bytes is malformed.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            4 => Ok(Self {
                secs: BigEndian::read_u32(payload) as i64,
                nanos: 0,
            }),
            8 => {
                let packed = BigEndian::read_u64(payload);
                let nanos = (packed >> 34) as u32;
                if nanos > MAX_NANOSEC {
                    return Err(Error::BadData(format!(
                        "timestamp nanoseconds field is {}",
                        nanos
                    )));
                }
                Ok(Self {
                    secs: (packed & 0x3_FFFF_FFFF) as i64,
                    nanos,
                })
            }
            12 => {
                let nanos = BigEndian::read_u32(payload);
                let secs = BigEndian::read_i64(&payload[4..]);
                if nanos > MAX_NANOSEC {
                    return Err(Error::BadData(format!(
                        "timestamp nanoseconds field is {}",
                        nanos
                    )));
                }
                Ok(Self { secs, nanos })
            }
            len => Err(Error::BadData(format!(
                "timestamp extension payload is {} bytes, expected 4, 8, or 12",
                len
            ))),
        }
    }
}

impl cmp::Ord for Timestamp {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then(self.nanos.cmp(&other.nanos))
    }
}

impl cmp::PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.nanos == 0 {
            write!(f, "{}s", self.secs)
        } else {
            write!(f, "{}.{:09}s", self.secs, self.nanos)
        }
    }
}
