//! The Murmur3 partitioner, in the variant Cassandra uses: tail bytes are
//! sign-extended before mixing, so tokens agree with the server's even for
//! non-ASCII keys.

use std::num::Wrapping;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::BadQuery;
use crate::routing::Token;

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);

    k
}

#[inline]
fn mix_k1(mut k1: Wrapping<i64>) -> Wrapping<i64> {
    k1 *= C1;
    k1 = rotl64(k1, 31);
    k1 * C2
}

#[inline]
fn mix_k2(mut k2: Wrapping<i64>) -> Wrapping<i64> {
    k2 *= C2;
    k2 = rotl64(k2, 33);
    k2 * C1
}

/// Computes the token of a routing key: the first half of its
/// Murmur3 x64 128-bit hash.
pub fn murmur3_token(routing_key: &[u8]) -> Token {
    let total_len = routing_key.len();
    let mut h1 = Wrapping(0_i64);
    let mut h2 = Wrapping(0_i64);

    let mut body = routing_key;
    while body.len() >= 16 {
        let k1 = Wrapping(body.get_i64_le());
        let k2 = Wrapping(body.get_i64_le());

        h1 ^= mix_k1(k1);
        h1 = rotl64(h1, 27);
        h1 += h2;
        h1 = h1 * Wrapping(5) + Wrapping(0x52dce729);

        h2 ^= mix_k2(k2);
        h2 = rotl64(h2, 31);
        h2 += h1;
        h2 = h2 * Wrapping(5) + Wrapping(0x38495ab5);
    }

    let tail = body;
    if tail.len() > 8 {
        let mut k2 = Wrapping(0_i64);
        for i in (8..tail.len()).rev() {
            k2 ^= Wrapping(tail[i] as i8 as i64) << ((i - 8) * 8);
        }
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        let mut k1 = Wrapping(0_i64);
        for i in (0..tail.len().min(8)).rev() {
            k1 ^= Wrapping(tail[i] as i8 as i64) << (i * 8);
        }
        h1 ^= mix_k1(k1);
    }

    h1 ^= Wrapping(total_len as i64);
    h2 ^= Wrapping(total_len as i64);

    h1 += h2;
    h2 += h1;

    h1 = fmix(h1);
    h2 = fmix(h2);

    h1 += h2;

    Token::new(h1.0)
}

/// Builds the routing key of a partition key from its serialized components,
/// given in partition key order together with their bind marker index.
///
/// A single component is used as is. Components of a composite key are each
/// written as `[u16 length][bytes][0x00]`.
pub(crate) fn compose_routing_key<'a>(
    components: impl ExactSizeIterator<Item = (usize, &'a [u8])>,
) -> Result<Bytes, BadQuery> {
    if components.len() == 1 {
        let mut components = components;
        return Ok(components
            .next()
            .map(|(_, value)| Bytes::copy_from_slice(value))
            .unwrap_or_default());
    }

    let mut buf = BytesMut::new();
    for (index, value) in components {
        let len: u16 = value
            .len()
            .try_into()
            .map_err(|_| BadQuery::ValuesTooLongForKey {
                index,
                len: value.len(),
            })?;
        buf.put_u16(len);
        buf.put_slice(value);
        buf.put_u8(0);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn murmur3_matches_server_tokens() {
        setup_tracing();
        for (key, expected) in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_eq!(murmur3_token(key.as_bytes()).value(), expected, "key {key}");
        }
    }

    #[test]
    fn keys_longer_than_one_block_are_hashed_whole() {
        let long = "Zażółć gęślą jaźń. Litwo, ojczyzno moja".as_bytes();
        let prefix = &long[..16];
        assert_ne!(murmur3_token(long), murmur3_token(prefix));
        assert_eq!(murmur3_token(long), murmur3_token(&long.to_vec()));
    }

    #[test]
    fn single_component_key_is_raw() {
        let key = compose_routing_key([(0, &b"abc"[..])].into_iter()).unwrap();
        assert_eq!(&key[..], b"abc");
    }

    #[test]
    fn composite_key_is_length_prefixed() {
        let key = compose_routing_key([(1, &b"ab"[..]), (0, &[7u8][..])].into_iter()).unwrap();
        assert_eq!(&key[..], &[0, 2, b'a', b'b', 0, 0, 1, 7, 0]);
    }

    #[test]
    fn oversized_component_is_rejected() {
        let big = vec![0u8; 70_000];
        assert_matches!(
            compose_routing_key([(0, &b"a"[..]), (3, &big[..])].into_iter()),
            Err(BadQuery::ValuesTooLongForKey { index: 3, len: 70_000 })
        );
    }
}
