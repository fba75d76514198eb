//! This module holds entities whose goal is to enable routing requests optimally,
//! that is, choosing a target node which is a replica for the request's token.
//!
//! This includes:
//! - token representation,
//! - the Murmur3 partitioner, which computes a token from a routing key,
//! - the token ring and the replica locator, which finds replicas for a given token.

pub(crate) mod locator;
pub(crate) mod partitioner;

pub use partitioner::murmur3_token;

/// Token is a result of computing a hash of a partition key.
///
/// It is basically an i64 with one caveat: i64::MIN is not
/// a valid token. It is used to represent infinity.
/// For this reason tokens are normalized - i64::MIN
/// is replaced with i64::MAX.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Creates a new token with given value, normalizing the value if necessary
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}
