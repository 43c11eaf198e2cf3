//! Bit-packed object header
//!
//! Eight bytes sit between the raw allocation address and the user pointer
//! visible to generated code:
//!
//! ```text
//! [ 1 reserved bit ][ 23-bit refcount, big-endian ][ 4-bit value tag ][ 4 alignment bytes ]
//! ^~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~^
//! {raw address}                                                                {user pointer}
//! ```
//!
//! The value tag duplicates the low bits of the tagged pointer so the
//! header can be examined without the original word, which the leak report
//! relies on.

use byteorder::{BigEndian, ByteOrder};

use crate::alloc::LinearHeap;
use crate::value::PtrTag;

/// Bytes between the raw allocation address and the user pointer
pub const HEADER_SIZE: u32 = 8;

/// Width of the reference count field in bits
pub const REF_COUNT_BITS: u32 = 23;

/// Largest representable reference count
///
/// This is a real capacity ceiling on concurrent references to one object;
/// exceeding it surfaces as a typed error rather than wrapping.
pub const MAX_REF_COUNT: u32 = (1 << REF_COUNT_BITS) - 1;

/// Decoded view of one object header
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawHeader {
    pub ref_count: u32,
    pub value_tag: PtrTag,
}

impl RawHeader {
    /// Zeroes the header at `raw_ptr` and stamps it with a count of one
    pub fn init(heap: &mut LinearHeap, raw_ptr: u32, tag: PtrTag) {
        for i in 0..HEADER_SIZE {
            heap.set_byte(raw_ptr + i, 0);
        }

        RawHeader {
            ref_count: 1,
            value_tag: tag,
        }
        .write(heap, raw_ptr + HEADER_SIZE);
    }

    pub fn read(heap: &LinearHeap, user_ptr: u32) -> RawHeader {
        debug_assert!(user_ptr >= HEADER_SIZE);
        let raw_ptr = user_ptr - HEADER_SIZE;

        let ref_count = BigEndian::read_u24(heap.slice(raw_ptr, 3)) & MAX_REF_COUNT;
        let value_tag = PtrTag::from_header_bits(heap.byte(raw_ptr + 3) & 0x0F);

        RawHeader {
            ref_count,
            value_tag,
        }
    }

    pub fn write(self, heap: &mut LinearHeap, user_ptr: u32) {
        debug_assert!(user_ptr >= HEADER_SIZE);
        debug_assert!(self.ref_count <= MAX_REF_COUNT);
        let raw_ptr = user_ptr - HEADER_SIZE;

        BigEndian::write_u24(heap.slice_mut(raw_ptr, 3), self.ref_count & MAX_REF_COUNT);
        heap.set_byte(raw_ptr + 3, self.value_tag.header_bits() & 0x0F);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_sets_count_one_and_tag() {
        let mut heap = LinearHeap::with_capacity(64);
        RawHeader::init(&mut heap, 8, PtrTag::Tuple);

        let header = RawHeader::read(&heap, 16);
        assert_eq!(1, header.ref_count);
        assert_eq!(PtrTag::Tuple, header.value_tag);
    }

    #[test]
    fn count_round_trips_at_the_field_boundary() {
        let mut heap = LinearHeap::with_capacity(64);
        RawHeader::init(&mut heap, 0, PtrTag::Closure);

        for &count in &[0, 1, 255, 256, 65_535, 65_536, MAX_REF_COUNT] {
            RawHeader {
                ref_count: count,
                value_tag: PtrTag::Closure,
            }
            .write(&mut heap, 8);

            let header = RawHeader::read(&heap, 8);
            assert_eq!(count, header.ref_count);
            assert_eq!(PtrTag::Closure, header.value_tag);
        }
    }

    #[test]
    fn count_and_tag_are_independent() {
        let mut heap = LinearHeap::with_capacity(64);

        RawHeader {
            ref_count: 0x12_3456,
            value_tag: PtrTag::GenericHeap,
        }
        .write(&mut heap, 8);

        let header = RawHeader::read(&heap, 8);
        assert_eq!(0x12_3456, header.ref_count);
        assert_eq!(PtrTag::GenericHeap, header.value_tag);
    }
}
