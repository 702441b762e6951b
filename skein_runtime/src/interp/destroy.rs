//! Destroy traversal: release every embedded reference, touch nothing else.

use skein_types::kind::NUM_KINDS;
use skein_types::layout::{
    self, split_instruction_word, tag_bytes_for_pattern, VALUE_BUFFER_WORDS, WORD,
};
use skein_types::RefKind;

use crate::host::{HeapObject, UnownedSlot, WeakSlot};
use crate::metadata::{existential_type_desc, TypeDesc};
use crate::reader::{read_relative_fn, read_tag_bytes, LayoutReader};

use super::{
    load_word, reserved_kind, resilient_type_desc, GetEnumTagFn, UnaryStepFn,
};

fn end_marker(_: &TypeDesc, _: &mut LayoutReader, _: &mut usize, _: *mut u8) {}

fn error_destroy(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8) {
    let object = unsafe { load_word(addr, *addr_offset) };
    *addr_offset += WORD;
    (md.host.error_release)(object as *mut HeapObject);
}

fn native_strong_destroy(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let object = unsafe { load_word(addr, *addr_offset) } & !md.host.spare_bits_mask;
    *addr_offset += WORD;
    (md.host.strong_release)(object as *mut HeapObject);
}

fn unowned_destroy(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8) {
    let object = unsafe { load_word(addr, *addr_offset) } & !md.host.spare_bits_mask;
    *addr_offset += WORD;
    (md.host.unowned_release)(object as *mut HeapObject);
}

fn weak_destroy(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8) {
    let slot = unsafe { addr.add(*addr_offset) } as *mut WeakSlot;
    *addr_offset += WORD;
    (md.host.weak_destroy)(slot);
}

fn unknown_destroy(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8) {
    let object = unsafe { load_word(addr, *addr_offset) };
    *addr_offset += WORD;
    (md.host.unknown_release)(object as *mut HeapObject);
}

fn unknown_unowned_destroy(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let slot = unsafe { addr.add(*addr_offset) } as *mut UnownedSlot;
    *addr_offset += WORD;
    (md.host.unknown_unowned_destroy)(slot);
}

fn unknown_weak_destroy(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let slot = unsafe { addr.add(*addr_offset) } as *mut WeakSlot;
    *addr_offset += WORD;
    (md.host.unknown_weak_destroy)(slot);
}

fn bridge_destroy(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8) {
    let object = unsafe { load_word(addr, *addr_offset) };
    *addr_offset += WORD;
    (md.host.bridge_release)(object as *mut HeapObject);
}

fn block_destroy(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8) {
    let block = unsafe { load_word(addr, *addr_offset) };
    *addr_offset += WORD;
    (md.host.block_release)(block as *mut u8);
}

fn objc_strong_destroy(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let word = unsafe { load_word(addr, *addr_offset) };
    *addr_offset += WORD;
    // Tagged pointers carry no refcount.
    if word & md.host.reserved_bits_mask != 0 {
        return;
    }
    (md.host.foreign_release)((word & !md.host.spare_bits_mask) as *mut HeapObject);
}

fn metatype_destroy(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let ty = unsafe { &*reader.read::<*const TypeDesc>() };
    let object = unsafe { addr.add(*addr_offset) };
    *addr_offset += ty.size();
    ty.vw_destroy(object);
}

fn existential_destroy(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let object = unsafe { addr.add(*addr_offset) };
    let ty = unsafe { existential_type_desc(object) };
    *addr_offset += WORD * VALUE_BUFFER_WORDS;
    if ty.flags().is_value_inline() {
        ty.vw_destroy(object);
    } else {
        let heap_box = unsafe { load_word(object, 0) };
        (md.host.strong_release)(heap_box as *mut HeapObject);
    }
}

fn resilient_destroy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let ty = unsafe { resilient_type_desc(md, reader) };
    let object = unsafe { addr.add(*addr_offset) };
    *addr_offset += ty.size();
    ty.vw_destroy(object);
}

fn single_payload_enum_simple_destroy(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let (byte_counts, payload_size, zero_tag, xi_tag_values, ref_count_bytes, skip) = unsafe {
        (
            reader.read::<u64>(),
            reader.read::<usize>(),
            reader.read::<u64>(),
            reader.read::<usize>(),
            reader.read::<usize>(),
            reader.read::<usize>(),
        )
    };

    let extra_tag_pattern = layout::extra_tag_pattern(byte_counts);
    let mut xi_tag_pattern = layout::xi_tag_pattern(byte_counts);
    let xi_tag_offset = layout::xi_tag_offset(byte_counts) as usize;

    if extra_tag_pattern != 0 {
        let extra_tag_bytes = tag_bytes_for_pattern(extra_tag_pattern);
        let tag = unsafe {
            read_tag_bytes(addr.add(*addr_offset + payload_size), extra_tag_bytes)
        };
        if tag != 0 {
            xi_tag_pattern = 0;
        }
    }

    if xi_tag_pattern != 0 {
        let xi_tag_bytes = tag_bytes_for_pattern(xi_tag_pattern);
        let tag = unsafe { read_tag_bytes(addr.add(*addr_offset + xi_tag_offset), xi_tag_bytes) }
            .wrapping_sub(zero_tag);
        if tag >= xi_tag_values as u64 {
            // Payload case: fall through into the sub-stream.
            return;
        }
    }

    reader.skip(ref_count_bytes);
    *addr_offset += skip;
}

fn single_payload_enum_fn_destroy(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let get_enum_tag: GetEnumTagFn = unsafe { read_relative_fn(reader) };
    let tag = get_enum_tag(unsafe { addr.add(*addr_offset) });

    if tag == 0 {
        reader.skip(2 * WORD);
    } else {
        let ref_count_bytes = unsafe { reader.read::<usize>() };
        let skip = unsafe { reader.read::<usize>() };
        reader.skip(ref_count_bytes);
        *addr_offset += skip;
    }
}

fn single_payload_enum_fn_resolved_destroy(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let get_enum_tag = unsafe { reader.read::<GetEnumTagFn>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let skip = unsafe { reader.read::<usize>() };

    if get_enum_tag(unsafe { addr.add(*addr_offset) }) != 0 {
        reader.skip(ref_count_bytes);
        *addr_offset += skip;
    }
}

fn single_payload_enum_generic_destroy(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let tag_bytes_and_offset = unsafe { reader.read::<u64>() };
    let payload_size = unsafe { reader.read::<usize>() };
    let mut xi_type = unsafe { reader.read::<*const TypeDesc>() };
    let num_empty_cases = unsafe { reader.read::<u32>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let skip = unsafe { reader.read::<usize>() };

    let extra_tag_pattern = layout::extra_tag_pattern(tag_bytes_and_offset);
    let xi_tag_offset = layout::xi_tag_offset(tag_bytes_and_offset) as usize;

    if extra_tag_pattern != 0 {
        let extra_tag_bytes = tag_bytes_for_pattern(extra_tag_pattern);
        let tag = unsafe {
            read_tag_bytes(addr.add(*addr_offset + payload_size), extra_tag_bytes)
        };
        if tag != 0 {
            xi_type = std::ptr::null();
        }
    }

    if !xi_type.is_null() {
        let ty = unsafe { &*xi_type };
        let tag = ty.vw_get_enum_tag_single_payload(
            unsafe { addr.add(*addr_offset + xi_tag_offset) },
            num_empty_cases,
        );
        if tag == 0 {
            return;
        }
    }

    reader.skip(ref_count_bytes);
    *addr_offset += skip;
}

fn multi_payload_enum_fn_destroy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let get_enum_tag: GetEnumTagFn = unsafe { read_relative_fn(reader) };
    multi_payload_destroy_body(md, reader, addr_offset, addr, get_enum_tag);
}

fn multi_payload_enum_fn_resolved_destroy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let get_enum_tag = unsafe { reader.read::<GetEnumTagFn>() };
    multi_payload_destroy_body(md, reader, addr_offset, addr, get_enum_tag);
}

fn multi_payload_destroy_body(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
    get_enum_tag: GetEnumTagFn,
) {
    let num_payloads = unsafe { reader.read::<usize>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let enum_size = unsafe { reader.read::<usize>() };
    let mut nested = *reader;
    let mut nested_offset = *addr_offset;

    let tag = get_enum_tag(unsafe { addr.add(*addr_offset) }) as usize;
    reader.skip(ref_count_bytes + num_payloads * WORD);
    *addr_offset += enum_size;

    if tag < num_payloads {
        let payload_offset = unsafe { nested.peek::<usize>(tag * WORD) };
        nested.skip(num_payloads * WORD + payload_offset);
        drive_destroy(md, &mut nested, &mut nested_offset, addr);
    }
}

fn multi_payload_enum_generic_destroy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let tag_bytes = unsafe { reader.read::<usize>() };
    let num_payloads = unsafe { reader.read::<usize>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let enum_size = unsafe { reader.read::<usize>() };
    let mut nested = *reader;
    let mut nested_offset = *addr_offset;

    let tag = unsafe {
        read_tag_bytes(addr.add(*addr_offset + enum_size - tag_bytes), tag_bytes)
    } as usize;
    reader.skip(ref_count_bytes + num_payloads * WORD);
    *addr_offset += enum_size;

    if tag < num_payloads {
        let payload_offset = unsafe { nested.peek::<usize>(tag * WORD) };
        nested.skip(num_payloads * WORD + payload_offset);
        drive_destroy(md, &mut nested, &mut nested_offset, addr);
    }
}

pub(crate) static DESTROY_TABLE: [UnaryStepFn; NUM_KINDS] = [
    end_marker,
    error_destroy,
    native_strong_destroy,
    unowned_destroy,
    weak_destroy,
    unknown_destroy,
    unknown_unowned_destroy,
    unknown_weak_destroy,
    bridge_destroy,
    block_destroy,
    objc_strong_destroy,
    reserved_kind, // Custom
    metatype_destroy,
    reserved_kind, // Generic
    existential_destroy,
    resilient_destroy,
    single_payload_enum_simple_destroy,
    single_payload_enum_fn_destroy,
    single_payload_enum_fn_resolved_destroy,
    single_payload_enum_generic_destroy,
    multi_payload_enum_fn_destroy,
    multi_payload_enum_fn_resolved_destroy,
    multi_payload_enum_generic_destroy,
];

pub(crate) fn drive_destroy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    loop {
        let (kind, gap) = split_instruction_word(unsafe { reader.read::<u64>() });
        *addr_offset += gap as usize;
        if kind == RefKind::End as u8 {
            return;
        }
        let step = DESTROY_TABLE
            .get(kind as usize)
            .unwrap_or_else(|| panic!("unknown layout instruction kind {kind:#04x}"));
        step(md, reader, addr_offset, addr);
    }
}
