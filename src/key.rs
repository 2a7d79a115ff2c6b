use byteorder::{ByteOrder, NativeEndian};

/// An ordered, fixed-width key. `WIDTH` is the on-disk byte size; the codec
/// uses it to derive `FANOUT` and to size the key array of every node.
///
/// Comparison is whatever `Ord` says: numeric order for integer keys,
/// big-endian lexicographic byte order for hash keys (their `Ord` impl is
/// the derived array comparison, which already reads as memcmp).
pub trait Key: Copy + Ord + std::fmt::Debug {
    const WIDTH: usize;

    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;

    /// Placeholder value for an internal node's dead last key slot (see
    /// `DESIGN.md`'s note on internal-node catch-all children). Never
    /// compared against by search; only ever written.
    fn zero() -> Self;
}

/// Integer-mode key: a bare 64-bit unsigned value, stored host-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IntegerKey(pub u64);

impl Key for IntegerKey {
    const WIDTH: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        NativeEndian::write_u64(buf, self.0);
    }

    fn read_from(buf: &[u8]) -> Self {
        IntegerKey(NativeEndian::read_u64(buf))
    }

    fn zero() -> Self {
        IntegerKey(0)
    }
}

macro_rules! hash_key {
    ($name:ident, $width:expr) => {
        /// Fixed-width hash-mode key.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub [u8; $width]);

        impl Key for $name {
            const WIDTH: usize = $width;

            fn write_to(&self, buf: &mut [u8]) {
                buf[..$width].copy_from_slice(&self.0);
            }

            fn read_from(buf: &[u8]) -> Self {
                let mut bytes = [0u8; $width];
                bytes.copy_from_slice(&buf[..$width]);
                $name(bytes)
            }

            fn zero() -> Self {
                $name([0u8; $width])
            }
        }
    };
}

// Widths mirror the digest-truncation modes of the format this engine's
// on-disk layout descends from: half-MD5 (8), SHA-1 (20), MD5 (16),
// SHA-256 (32).
hash_key!(HashKey8, 8);
hash_key!(HashKey16, 16);
hash_key!(HashKey20, 20);
hash_key!(HashKey32, 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_key_round_trips() {
        let mut buf = [0u8; 8];
        IntegerKey(0x1122_3344_5566_7788).write_to(&mut buf);
        assert_eq!(IntegerKey(0x1122_3344_5566_7788), IntegerKey::read_from(&buf));
    }

    #[test]
    fn integer_key_orders_numerically() {
        assert!(IntegerKey(1) < IntegerKey(2));
        assert!(IntegerKey(u64::MAX) > IntegerKey(0));
    }

    #[test]
    fn hash_key_round_trips() {
        let mut buf = [0u8; 16];
        let k = HashKey16([7u8; 16]);
        k.write_to(&mut buf);
        assert_eq!(k, HashKey16::read_from(&buf));
    }

    #[test]
    fn hash_key_orders_lexicographically() {
        assert!(HashKey8([0, 0, 0, 0, 0, 0, 0, 1]) < HashKey8([0, 0, 0, 0, 0, 0, 0, 2]));
        assert!(HashKey8([1, 0, 0, 0, 0, 0, 0, 0]) > HashKey8([0, 255, 255, 255, 255, 255, 255, 255]));
    }
}
