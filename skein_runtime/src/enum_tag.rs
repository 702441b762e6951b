//! Enum tag read/write entry points.
//!
//! These re-enter the layout string at the enum instruction's operands
//! (header plus one tagged word) and compute or store the case index without
//! running a full traversal.

use std::ptr;

use skein_types::layout::{self, tag_bytes_for_pattern, LAYOUT_HEADER_BYTES, WORD};

use crate::metadata::TypeDesc;
use crate::reader::{read_relative_fn_at, read_tag_bytes, LayoutCursor};

use crate::interp::GetEnumTagFn;

/// Loads up to four bytes of an enum payload region, zero-extended.
fn load_enum_element(addr: *const u8, size: usize) -> u32 {
    let mut out = [0u8; 4];
    let n = size.min(4);
    unsafe { ptr::copy_nonoverlapping(addr, out.as_mut_ptr(), n) };
    u32::from_ne_bytes(out)
}

/// Stores a case index into an enum payload region, zero-filling any bytes
/// past the four the index can occupy.
fn store_enum_element(addr: *mut u8, value: u32, size: usize) {
    let bytes = value.to_ne_bytes();
    let n = size.min(4);
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), addr, n);
        if size > 4 {
            ptr::write_bytes(addr.add(4), 0, size - 4);
        }
    }
}

/// Cursor positioned at the first operand of the leading enum instruction.
fn operand_cursor(md: &TypeDesc) -> LayoutCursor {
    LayoutCursor::new(md.layout_string(), LAYOUT_HEADER_BYTES + 8)
}

/// # Safety
/// `metadata` must be a valid descriptor. Trivially safe otherwise; the
/// one-case enum stores nothing.
#[no_mangle]
pub unsafe extern "C" fn sk_singleton_enum_get_enum_tag(
    _value: *const u8, _metadata: *const TypeDesc,
) -> u32 {
    0
}

/// # Safety
/// As [`sk_singleton_enum_get_enum_tag`].
#[no_mangle]
pub unsafe extern "C" fn sk_singleton_enum_destructive_inject_enum_tag(
    _value: *mut u8, _tag: u32, _metadata: *const TypeDesc,
) {
}

struct SimpleEnumHeader {
    extra_tag_pattern: u8,
    xi_tag_pattern: u8,
    xi_tag_offset: usize,
    payload_size: usize,
    zero_tag_value: u64,
    payload_extra_inhabitants: usize,
}

unsafe fn read_simple_enum_header(cursor: &mut LayoutCursor) -> SimpleEnumHeader {
    let byte_counts = cursor.read::<u64>();
    SimpleEnumHeader {
        extra_tag_pattern: layout::extra_tag_pattern(byte_counts),
        xi_tag_pattern: layout::xi_tag_pattern(byte_counts),
        xi_tag_offset: layout::xi_tag_offset(byte_counts) as usize,
        payload_size: cursor.read::<usize>(),
        zero_tag_value: cursor.read::<u64>(),
        payload_extra_inhabitants: cursor.read::<usize>(),
    }
}

/// Case index for the empty case addressed by non-zero extra-tag bytes:
/// low bits from the payload area, high bits from the tag area, biased past
/// the extra-inhabitant cases and the payload case.
fn no_payload_case_index(
    addr: *const u8, payload_size: usize, extra_tag: u64, payload_extra_inhabitants: usize,
) -> u32 {
    let from_extra_bits = if payload_size >= 4 {
        0
    } else {
        (extra_tag as u32 - 1) << (payload_size * 8)
    };
    let from_value = load_enum_element(addr, payload_size);
    (from_extra_bits | from_value) + payload_extra_inhabitants as u32 + 1
}

/// Splits an empty-case index into its payload-area and tag-area parts.
fn split_no_payload_case(tag: u32, payload_size: usize, payload_extra_inhabitants: usize) -> (u32, u32) {
    let no_payload_index = tag - 1;
    let case_index = no_payload_index - payload_extra_inhabitants as u32;
    if payload_size >= 4 {
        (case_index, 1)
    } else {
        let payload_bits = payload_size as u32 * 8;
        (
            case_index & ((1u32 << payload_bits) - 1),
            1 + (case_index >> payload_bits),
        )
    }
}

/// # Safety
/// `value` must hold a live value of `metadata`'s type, whose layout string
/// leads with a simple single-payload enum instruction.
#[no_mangle]
pub unsafe extern "C" fn sk_enum_simple_get_enum_tag(
    value: *const u8, metadata: *const TypeDesc,
) -> u32 {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let h = read_simple_enum_header(&mut cursor);

    if h.extra_tag_pattern != 0 {
        let num_extra_tag_bytes = tag_bytes_for_pattern(h.extra_tag_pattern);
        let extra_tag = read_tag_bytes(value.add(h.payload_size), num_extra_tag_bytes);
        if extra_tag != 0 {
            return no_payload_case_index(
                value,
                h.payload_size,
                extra_tag,
                h.payload_extra_inhabitants,
            );
        }
    }

    if h.xi_tag_pattern != 0 {
        let xi_tag_bytes = tag_bytes_for_pattern(h.xi_tag_pattern);
        let tag = read_tag_bytes(value.add(h.xi_tag_offset), xi_tag_bytes)
            .wrapping_sub(h.zero_tag_value);
        if tag < h.payload_extra_inhabitants as u64 {
            return tag as u32 + 1;
        }
    }

    0
}

/// # Safety
/// As [`sk_enum_simple_get_enum_tag`]; overwrites the value's tag fields.
#[no_mangle]
pub unsafe extern "C" fn sk_enum_simple_destructive_inject_enum_tag(
    value: *mut u8, tag: u32, metadata: *const TypeDesc,
) {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let h = read_simple_enum_header(&mut cursor);
    let num_extra_tag_bytes = if h.extra_tag_pattern != 0 {
        tag_bytes_for_pattern(h.extra_tag_pattern)
    } else {
        0
    };

    if h.extra_tag_pattern != 0 && tag as u64 > h.payload_extra_inhabitants as u64 {
        let (payload_index, extra_tag_index) =
            split_no_payload_case(tag, h.payload_size, h.payload_extra_inhabitants);
        if h.payload_size != 0 {
            store_enum_element(value, payload_index, h.payload_size);
        }
        if num_extra_tag_bytes != 0 {
            store_enum_element(value.add(h.payload_size), extra_tag_index, num_extra_tag_bytes);
        }
        return;
    }

    if h.xi_tag_pattern != 0 {
        let xi_tag_bytes = tag_bytes_for_pattern(h.xi_tag_pattern);
        if tag as u64 <= h.payload_extra_inhabitants as u64 {
            if num_extra_tag_bytes != 0 {
                store_enum_element(value.add(h.payload_size), 0, num_extra_tag_bytes);
            }
            if tag == 0 {
                return;
            }
            let stored = (tag as u64 - 1).wrapping_add(h.zero_tag_value);
            store_enum_element(value.add(h.xi_tag_offset), stored as u32, xi_tag_bytes);
        }
    }
}

/// # Safety
/// The layout string must lead with a tag-function enum instruction whose
/// embedded pointer is valid for this process image.
#[no_mangle]
pub unsafe extern "C" fn sk_enum_fn_get_enum_tag(
    value: *const u8, metadata: *const TypeDesc,
) -> u32 {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let get_enum_tag: GetEnumTagFn = read_relative_fn_at(&mut cursor);
    get_enum_tag(value)
}

struct GenericEnumHeader {
    extra_tag_pattern: u8,
    xi_tag_offset: usize,
    payload_size: usize,
    xi_type: *const TypeDesc,
    num_empty_cases: u32,
}

unsafe fn read_generic_enum_header(cursor: &mut LayoutCursor) -> GenericEnumHeader {
    let tag_bytes_and_offset = cursor.read::<u64>();
    GenericEnumHeader {
        extra_tag_pattern: layout::extra_tag_pattern(tag_bytes_and_offset),
        xi_tag_offset: layout::xi_tag_offset(tag_bytes_and_offset) as usize,
        payload_size: cursor.read::<usize>(),
        xi_type: cursor.read::<*const TypeDesc>(),
        num_empty_cases: cursor.read::<u32>(),
    }
}

/// # Safety
/// As [`sk_enum_simple_get_enum_tag`], for the generic single-payload shape;
/// the embedded XI type descriptor must be live.
#[no_mangle]
pub unsafe extern "C" fn sk_single_payload_enum_generic_get_enum_tag(
    value: *const u8, metadata: *const TypeDesc,
) -> u32 {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let h = read_generic_enum_header(&mut cursor);
    let payload_extra_inhabitants = if h.xi_type.is_null() {
        0
    } else {
        (*h.xi_type).extra_inhabitants() as usize
    };

    if h.extra_tag_pattern != 0 {
        let num_extra_tag_bytes = tag_bytes_for_pattern(h.extra_tag_pattern);
        let extra_tag = read_tag_bytes(value.add(h.payload_size), num_extra_tag_bytes);
        if extra_tag != 0 {
            return no_payload_case_index(
                value,
                h.payload_size,
                extra_tag,
                payload_extra_inhabitants,
            );
        }
    }

    if !h.xi_type.is_null() {
        return (*h.xi_type)
            .vw_get_enum_tag_single_payload(value.add(h.xi_tag_offset), h.num_empty_cases);
    }

    0
}

/// # Safety
/// As [`sk_single_payload_enum_generic_get_enum_tag`]; overwrites tag fields.
#[no_mangle]
pub unsafe extern "C" fn sk_single_payload_enum_generic_destructive_inject_enum_tag(
    value: *mut u8, tag: u32, metadata: *const TypeDesc,
) {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let h = read_generic_enum_header(&mut cursor);
    let payload_extra_inhabitants = if h.xi_type.is_null() {
        0
    } else {
        (*h.xi_type).extra_inhabitants() as usize
    };

    if h.extra_tag_pattern != 0 && tag as u64 > payload_extra_inhabitants as u64 {
        let num_extra_tag_bytes = tag_bytes_for_pattern(h.extra_tag_pattern);
        let (payload_index, extra_tag_index) =
            split_no_payload_case(tag, h.payload_size, payload_extra_inhabitants);
        if h.payload_size != 0 {
            store_enum_element(value, payload_index, h.payload_size);
        }
        if num_extra_tag_bytes != 0 {
            store_enum_element(value.add(h.payload_size), extra_tag_index, num_extra_tag_bytes);
        }
        return;
    }

    if tag as u64 <= payload_extra_inhabitants as u64 {
        if h.extra_tag_pattern != 0 {
            let num_extra_tag_bytes = tag_bytes_for_pattern(h.extra_tag_pattern);
            store_enum_element(value.add(h.payload_size), 0, num_extra_tag_bytes);
        }
        if tag == 0 {
            return;
        }
        (*h.xi_type).vw_store_enum_tag_single_payload(
            value.add(h.xi_tag_offset),
            tag,
            h.num_empty_cases,
        );
    }
}

struct MultiPayloadHeader {
    tag_bytes: usize,
    num_payloads: usize,
    payload_size: usize,
}

unsafe fn read_multi_payload_header(cursor: &mut LayoutCursor) -> MultiPayloadHeader {
    let tag_bytes = cursor.read::<usize>();
    let num_payloads = cursor.read::<usize>();
    cursor.skip(WORD); // sub-stream byte count
    let enum_size = cursor.read::<usize>();
    MultiPayloadHeader {
        tag_bytes,
        num_payloads,
        payload_size: enum_size - tag_bytes,
    }
}

/// # Safety
/// The layout string must lead with a generic multi-payload enum
/// instruction and `value` must hold a live value of that shape.
#[no_mangle]
pub unsafe extern "C" fn sk_multi_payload_enum_generic_get_enum_tag(
    value: *const u8, metadata: *const TypeDesc,
) -> u32 {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let h = read_multi_payload_header(&mut cursor);

    let enum_tag = read_tag_bytes(value.add(h.payload_size), h.tag_bytes) as u32;
    if (enum_tag as usize) < h.num_payloads {
        return enum_tag;
    }

    let payload_value = load_enum_element(value, h.payload_size);
    if h.payload_size >= 4 {
        h.num_payloads as u32 + payload_value
    } else {
        let payload_bits = h.payload_size as u32 * 8;
        (payload_value | (enum_tag - h.num_payloads as u32) << payload_bits)
            + h.num_payloads as u32
    }
}

/// # Safety
/// As [`sk_multi_payload_enum_generic_get_enum_tag`]; overwrites tag fields.
#[no_mangle]
pub unsafe extern "C" fn sk_multi_payload_enum_generic_destructive_inject_enum_tag(
    value: *mut u8, tag: u32, metadata: *const TypeDesc,
) {
    let md = &*metadata;
    let mut cursor = operand_cursor(md);
    let h = read_multi_payload_header(&mut cursor);

    if (tag as usize) < h.num_payloads {
        store_enum_element(value.add(h.payload_size), tag, h.tag_bytes);
    } else {
        let which_empty_case = tag - h.num_payloads as u32;
        let (which_tag, which_payload_value) = if h.payload_size >= 4 {
            (h.num_payloads as u32, which_empty_case)
        } else {
            let payload_bits = h.payload_size as u32 * 8;
            (
                h.num_payloads as u32 + (which_empty_case >> payload_bits),
                which_empty_case & ((1u32 << payload_bits) - 1),
            )
        };
        store_enum_element(value.add(h.payload_size), which_tag, h.tag_bytes);
        store_enum_element(value, which_payload_value, h.payload_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use skein_types::builder::{GenericEnumParams, LayoutBuilder, SimpleEnumParams};

    #[test]
    fn enum_element_load_caps_at_four_bytes() {
        let data: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        assert_eq!(load_enum_element(data.as_ptr(), 0), 0);
        assert_eq!(load_enum_element(data.as_ptr(), 1), 0x11);
        assert_eq!(load_enum_element(data.as_ptr(), 2), 0x2211);
        assert_eq!(load_enum_element(data.as_ptr(), 8), 0x44332211);
    }

    #[test]
    fn enum_element_store_zero_fills() {
        let mut data = [0xffu8; 8];
        store_enum_element(data.as_mut_ptr(), 0x0102, 8);
        assert_eq!(data, [0x02, 0x01, 0, 0, 0, 0, 0, 0]);

        let mut data = [0xffu8; 2];
        store_enum_element(data.as_mut_ptr(), 0x0102, 2);
        assert_eq!(data, [0x02, 0x01]);
    }

    #[test]
    fn no_payload_round_trip_small_payload() {
        // payload of 1 byte, 2 extra inhabitants: indices split across the
        // payload byte and the extra tag byte.
        for tag in 3..40u32 {
            let (payload_index, extra_tag_index) = split_no_payload_case(tag, 1, 2);
            let mut value = [0u8; 2];
            store_enum_element(value.as_mut_ptr(), payload_index, 1);
            store_enum_element(value.as_mut_ptr().wrapping_add(1), extra_tag_index, 1);
            let extra = u64::from(value[1]);
            assert_ne!(extra, 0);
            assert_eq!(no_payload_case_index(value.as_ptr(), 1, extra, 2), tag);
        }
    }

    #[test]
    fn singleton_tag_is_always_zero() {
        let mut b = LayoutBuilder::new();
        b.end(0);
        let md = leak_generic_type(0, 0, b.finish());
        let mut value = [0u8; 8];
        unsafe {
            sk_singleton_enum_destructive_inject_enum_tag(value.as_mut_ptr(), 0, md);
            assert_eq!(sk_singleton_enum_get_enum_tag(value.as_ptr(), md), 0);
        }
        assert_eq!(value, [0u8; 8]);
    }

    fn simple_tag_type() -> &'static TypeDesc {
        // 2-byte payload with a 1-byte XI field at offset 0 (three spare
        // patterns starting at 2) and one extra tag byte after the payload.
        let mut b = LayoutBuilder::new();
        b.single_payload_enum_simple(
            0,
            SimpleEnumParams {
                extra_tag_pattern: 1,
                xi_pattern: 1,
                xi_offset: 0,
                payload_size: 2,
                zero_tag_value: 2,
                xi_tag_values: 3,
                skip: 3,
            },
            |_| {},
        );
        b.end(0);
        leak_generic_type(3, 0, b.finish())
    }

    #[test]
    fn simple_enum_tag_round_trip() {
        let md = simple_tag_type();
        for tag in [0u32, 1, 2, 3, 4, 5, 40, 700] {
            let mut value = [0xffu8, 0xff, 0xff];
            unsafe {
                sk_enum_simple_destructive_inject_enum_tag(value.as_mut_ptr(), tag, md);
                assert_eq!(
                    sk_enum_simple_get_enum_tag(value.as_ptr(), md),
                    tag,
                    "tag {tag} (value {value:?})"
                );
            }
        }
    }

    #[test]
    fn simple_enum_tag_xi_encoding() {
        let md = simple_tag_type();
        let mut value = [0xffu8, 0xff, 0xff];
        unsafe {
            sk_enum_simple_destructive_inject_enum_tag(value.as_mut_ptr(), 2, md);
        }
        // Tag 2 occupies XI pattern zero_tag + 1 with cleared extra bytes.
        assert_eq!(value[0], 3);
        assert_eq!(value[2], 0);
    }

    extern "C" fn tag_low_byte(addr: *const u8) -> u32 {
        unsafe { *addr as u32 }
    }

    #[test]
    fn fn_enum_tag_calls_through_relative_pointer() {
        let mut b = LayoutBuilder::new();
        b.single_payload_enum_fn(0, tag_low_byte as usize, 8, |b| b.native_strong(0));
        b.end(0);
        let md = leak_generic_type(8, 0, b.finish());

        let value = word_bytes(&[9]);
        assert_eq!(unsafe { sk_enum_fn_get_enum_tag(value.as_ptr(), md) }, 9);
    }

    fn generic_tag_type(xi: &'static TypeDesc) -> &'static TypeDesc {
        // Word-sized payload hosting the XI type, one extra tag byte.
        let mut b = LayoutBuilder::new();
        b.single_payload_enum_generic(
            0,
            GenericEnumParams {
                extra_tag_pattern: 1,
                xi_offset: 0,
                payload_size: 8,
                xi_type: xi as *const TypeDesc as usize,
                num_empty_cases: 9,
                skip: 9,
            },
            |_| {},
        );
        b.end(0);
        leak_generic_type(9, 0, b.finish())
    }

    fn word_bytes(vals: &[usize]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn generic_enum_tag_round_trip() {
        let xi = leak_xi_word_type(5);
        let md = generic_tag_type(xi);
        for tag in [0u32, 1, 3, 5, 6, 9, 14] {
            let mut value = vec![0u8; 9];
            unsafe {
                sk_single_payload_enum_generic_destructive_inject_enum_tag(
                    value.as_mut_ptr(),
                    tag,
                    md,
                );
                assert_eq!(
                    sk_single_payload_enum_generic_get_enum_tag(value.as_ptr(), md),
                    tag,
                    "tag {tag} (value {value:?})"
                );
            }
        }
    }

    fn multi_payload_tag_type() -> &'static TypeDesc {
        let mut b = LayoutBuilder::new();
        b.multi_payload_enum_generic(
            0,
            1,
            9,
            &[
                &|b: &mut LayoutBuilder| {
                    b.native_strong(0);
                    b.end(0);
                },
                &|b: &mut LayoutBuilder| {
                    b.weak(0);
                    b.end(0);
                },
            ],
        );
        b.end(0);
        leak_generic_type(9, 0, b.finish())
    }

    #[test]
    fn multi_payload_enum_tag_round_trip() {
        let md = multi_payload_tag_type();
        for tag in [0u32, 1, 2, 3, 10, 90] {
            let mut value = vec![0u8; 9];
            unsafe {
                sk_multi_payload_enum_generic_destructive_inject_enum_tag(
                    value.as_mut_ptr(),
                    tag,
                    md,
                );
                assert_eq!(
                    sk_multi_payload_enum_generic_get_enum_tag(value.as_ptr(), md),
                    tag,
                    "tag {tag} (value {value:?})"
                );
            }
        }
    }

    #[test]
    fn multi_payload_tag_fields_land_where_drivers_look() {
        let md = multi_payload_tag_type();
        let mut value = vec![0u8; 9];
        unsafe {
            sk_multi_payload_enum_generic_destructive_inject_enum_tag(value.as_mut_ptr(), 1, md);
        }
        assert_eq!(value[8], 1);
    }
}
