//! Strongly-typed identifiers.
//!
//! Both identifiers are database-assigned `BIGSERIAL` values, so they wrap `i64`
//! rather than UUIDs.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Identifier of a queued job, assigned by the queue engine on insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

/// Identifier of a result group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(i64);

macro_rules! impl_int_newtype {
    ($t:ident) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = core::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self)
            }
        }
    };
}

impl_int_newtype!(JobId);
impl_int_newtype!(GroupId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from_file_stem() {
        assert_eq!("42".parse::<JobId>().unwrap(), JobId::new(42));
        assert!("42.json".parse::<JobId>().is_err());
        assert!("abc".parse::<GroupId>().is_err());
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&JobId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
