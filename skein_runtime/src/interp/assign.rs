//! Assign-with-copy traversal.
//!
//! Per field: retire the destination's reference, then take out the source's,
//! in that order, so assigning a value over itself never drops the shared
//! pointee early. Enum handlers split four ways on the (src, dest) tag pair
//! and step destination payloads down with the destroy primitives before
//! copying the source payload in.

use skein_types::kind::NUM_KINDS;
use skein_types::layout::{
    self, split_instruction_word, tag_bytes_for_pattern, VALUE_BUFFER_WORDS, WORD,
};
use skein_types::RefKind;

use crate::host::{HeapObject, UnownedSlot, WeakSlot};
use crate::metadata::{existential_type_desc, TypeDesc};
use crate::reader::{copy_value_bytes, read_relative_fn, read_tag_bytes, LayoutReader};

use super::destroy::{drive_destroy, DESTROY_TABLE};
use super::pair::{drive_init_with_copy, INIT_WITH_COPY_TABLE};
use super::{
    copy_gap, load_word, reserved_kind_pair, resilient_type_desc, store_word, GetEnumTagFn,
    PairStepFn,
};

fn end_marker(_: &TypeDesc, _: &mut LayoutReader, _: &mut usize, _: *mut u8, _: *mut u8) {}

fn error_assign(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8) {
    let off = *addr_offset;
    let dest_object = unsafe { load_word(dest, off) };
    let src_object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, src_object) };
    *addr_offset = off + WORD;
    (md.host.error_release)(dest_object as *mut HeapObject);
    (md.host.error_retain)(src_object as *mut HeapObject);
}

fn native_strong_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let dest_object = unsafe { load_word(dest, off) };
    let src_object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, src_object) };
    *addr_offset = off + WORD;
    let mask = md.host.spare_bits_mask;
    (md.host.strong_release)((dest_object & !mask) as *mut HeapObject);
    (md.host.strong_retain)((src_object & !mask) as *mut HeapObject);
}

fn unowned_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let dest_object = unsafe { load_word(dest, off) };
    let src_object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, src_object) };
    *addr_offset = off + WORD;
    let mask = md.host.spare_bits_mask;
    (md.host.unowned_release)((dest_object & !mask) as *mut HeapObject);
    (md.host.unowned_retain)((src_object & !mask) as *mut HeapObject);
}

fn weak_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.weak_copy_assign)(
        unsafe { dest.add(off) } as *mut WeakSlot,
        unsafe { src.add(off) } as *mut WeakSlot,
    );
}

fn unknown_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let dest_object = unsafe { load_word(dest, off) };
    let src_object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, src_object) };
    *addr_offset = off + WORD;
    (md.host.unknown_release)(dest_object as *mut HeapObject);
    (md.host.unknown_retain)(src_object as *mut HeapObject);
}

fn unknown_unowned_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.unknown_unowned_copy_assign)(
        unsafe { dest.add(off) } as *mut UnownedSlot,
        unsafe { src.add(off) } as *mut UnownedSlot,
    );
}

fn unknown_weak_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.unknown_weak_copy_assign)(
        unsafe { dest.add(off) } as *mut WeakSlot,
        unsafe { src.add(off) } as *mut WeakSlot,
    );
}

fn bridge_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let dest_object = unsafe { load_word(dest, off) };
    let src_object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, src_object) };
    *addr_offset = off + WORD;
    (md.host.bridge_release)(dest_object as *mut HeapObject);
    (md.host.bridge_retain)(src_object as *mut HeapObject);
}

fn block_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    (md.host.block_release)(unsafe { load_word(dest, off) } as *mut u8);
    let copy = (md.host.block_copy)(unsafe { load_word(src, off) } as *mut u8);
    unsafe { store_word(dest, off, copy as usize) };
    *addr_offset = off + WORD;
}

fn objc_strong_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let dest_object = unsafe { load_word(dest, off) };
    let src_object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, src_object) };
    *addr_offset = off + WORD;

    let reserved = md.host.reserved_bits_mask;
    let spare = md.host.spare_bits_mask;
    if dest_object & reserved == 0 {
        (md.host.foreign_release)((dest_object & !spare) as *mut HeapObject);
    }
    if src_object & reserved == 0 {
        (md.host.foreign_retain)((src_object & !spare) as *mut HeapObject);
    }
}

fn metatype_assign(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { &*reader.read::<*const TypeDesc>() };
    *addr_offset = off + ty.size();
    ty.vw_assign_with_copy(unsafe { dest.add(off) }, unsafe { src.add(off) });
}

fn existential_assign(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { existential_type_desc(src.add(off)) };
    *addr_offset = off + WORD * VALUE_BUFFER_WORDS;
    if ty.flags().is_value_inline() {
        ty.vw_assign_with_copy(unsafe { dest.add(off) }, unsafe { src.add(off) });
    } else {
        let dest_box = unsafe { load_word(dest, off) };
        (md.host.strong_release)(dest_box as *mut HeapObject);
        unsafe { copy_value_bytes(dest.add(off), src.add(off), WORD) };
        let src_box = unsafe { load_word(src, off) };
        (md.host.strong_retain)(src_box as *mut HeapObject);
    }
}

fn resilient_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { resilient_type_desc(md, reader) };
    *addr_offset = off + ty.size();
    ty.vw_assign_with_copy(unsafe { dest.add(off) }, unsafe { src.add(off) });
}

/// Executes exactly one instruction with the destroy primitives. Used to
/// step a destination payload down without consuming the outer cursor state.
fn step_destroy_one(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, addr: *mut u8,
) {
    let (kind, gap) = split_instruction_word(unsafe { reader.read::<u64>() });
    *addr_offset += gap as usize;
    if kind == RefKind::End as u8 {
        return;
    }
    DESTROY_TABLE[kind as usize](md, reader, addr_offset, addr);
}

/// One-instruction flavor of the copy driver, for copying a source payload
/// over a destination that held an empty case.
fn step_init_with_copy_one(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let (kind, gap) = split_instruction_word(unsafe { reader.read::<u64>() });
    unsafe { copy_gap(dest, src, *addr_offset, gap as usize) };
    *addr_offset += gap as usize;
    if kind == RefKind::End as u8 {
        return;
    }
    INIT_WITH_COPY_TABLE[kind as usize](md, reader, addr_offset, dest, src);
}

/// Tag-pair dispatch shared by the single-payload assign handlers once both
/// tags are known. `payload` is true for a tag naming the payload case.
/// Returns without touching the trailing skip region when the source holds
/// the payload (the sub-stream walk has already advanced the cursor) or when
/// both sides hold it (the outer driver falls through into the sub-stream).
#[allow(clippy::too_many_arguments)]
fn single_payload_assign_dispatch(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8,
    src: *mut u8, src_payload: bool, dest_payload: bool, ref_count_bytes: usize, skip: usize,
) {
    if src_payload && dest_payload {
        return;
    } else if src_payload {
        let end = reader.absolute() as usize + ref_count_bytes;
        while (reader.absolute() as usize) < end {
            step_init_with_copy_one(md, reader, addr_offset, dest, src);
        }
        return;
    } else if dest_payload {
        let end = reader.absolute() as usize + ref_count_bytes;
        let mut nested_offset = *addr_offset;
        while (reader.absolute() as usize) < end {
            step_destroy_one(md, reader, &mut nested_offset, dest);
        }
    } else {
        reader.skip(ref_count_bytes);
    }

    unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), skip) };
    *addr_offset += skip;
}

fn single_payload_enum_simple_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
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
    let xi_tag_pattern = layout::xi_tag_pattern(byte_counts);
    let xi_tag_offset = layout::xi_tag_offset(byte_counts) as usize;

    let mut src_tag: u64 = 0;
    let mut dest_tag: u64 = 0;

    if extra_tag_pattern != 0 {
        let extra_tag_bytes = tag_bytes_for_pattern(extra_tag_pattern);
        src_tag = unsafe { read_tag_bytes(src.add(*addr_offset + payload_size), extra_tag_bytes) };
        dest_tag =
            unsafe { read_tag_bytes(dest.add(*addr_offset + payload_size), extra_tag_bytes) };
    }

    if xi_tag_pattern != 0 {
        let xi_tag_bytes = tag_bytes_for_pattern(xi_tag_pattern);
        src_tag = if src_tag != 0 {
            0
        } else {
            unsafe { read_tag_bytes(src.add(*addr_offset + xi_tag_offset), xi_tag_bytes) }
                .wrapping_sub(zero_tag)
        };
        dest_tag = if dest_tag != 0 {
            0
        } else {
            unsafe { read_tag_bytes(dest.add(*addr_offset + xi_tag_offset), xi_tag_bytes) }
                .wrapping_sub(zero_tag)
        };
    }

    let xi_tag_values = xi_tag_values as u64;
    single_payload_assign_dispatch(
        md,
        reader,
        addr_offset,
        dest,
        src,
        src_tag >= xi_tag_values,
        dest_tag >= xi_tag_values,
        ref_count_bytes,
        skip,
    );
}

fn single_payload_enum_fn_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag: GetEnumTagFn = unsafe { read_relative_fn(reader) };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let skip = unsafe { reader.read::<usize>() };

    let src_tag = get_enum_tag(unsafe { src.add(*addr_offset) });
    let dest_tag = get_enum_tag(unsafe { dest.add(*addr_offset) });

    single_payload_assign_dispatch(
        md, reader, addr_offset, dest, src, src_tag == 0, dest_tag == 0, ref_count_bytes, skip,
    );
}

fn single_payload_enum_fn_resolved_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag = unsafe { reader.read::<GetEnumTagFn>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let skip = unsafe { reader.read::<usize>() };

    let src_tag = get_enum_tag(unsafe { src.add(*addr_offset) });
    let dest_tag = get_enum_tag(unsafe { dest.add(*addr_offset) });

    single_payload_assign_dispatch(
        md, reader, addr_offset, dest, src, src_tag == 0, dest_tag == 0, ref_count_bytes, skip,
    );
}

fn single_payload_enum_generic_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let tag_bytes_and_offset = unsafe { reader.read::<u64>() };
    let payload_size = unsafe { reader.read::<usize>() };
    let xi_type = unsafe { reader.read::<*const TypeDesc>() };
    let num_empty_cases = unsafe { reader.read::<u32>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let skip = unsafe { reader.read::<usize>() };

    let extra_tag_pattern = layout::extra_tag_pattern(tag_bytes_and_offset);
    let xi_tag_offset = layout::xi_tag_offset(tag_bytes_and_offset) as usize;

    let mut src_tag: u64 = 0;
    let mut dest_tag: u64 = 0;

    if extra_tag_pattern != 0 {
        let extra_tag_bytes = tag_bytes_for_pattern(extra_tag_pattern);
        src_tag = unsafe { read_tag_bytes(src.add(*addr_offset + payload_size), extra_tag_bytes) };
        dest_tag =
            unsafe { read_tag_bytes(dest.add(*addr_offset + payload_size), extra_tag_bytes) };
    }

    if !xi_type.is_null() {
        let ty = unsafe { &*xi_type };
        if src_tag == 0 {
            src_tag = ty.vw_get_enum_tag_single_payload(
                unsafe { src.add(*addr_offset + xi_tag_offset) },
                num_empty_cases,
            ) as u64;
        }
        if dest_tag == 0 {
            dest_tag = ty.vw_get_enum_tag_single_payload(
                unsafe { dest.add(*addr_offset + xi_tag_offset) },
                num_empty_cases,
            ) as u64;
        }
    }

    single_payload_assign_dispatch(
        md, reader, addr_offset, dest, src, src_tag == 0, dest_tag == 0, ref_count_bytes, skip,
    );
}

fn multi_payload_enum_fn_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag: GetEnumTagFn = unsafe { read_relative_fn(reader) };
    multi_payload_assign_body(md, reader, addr_offset, dest, src, |addr, _| {
        get_enum_tag(addr) as usize
    });
}

fn multi_payload_enum_fn_resolved_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag = unsafe { reader.read::<GetEnumTagFn>() };
    multi_payload_assign_body(md, reader, addr_offset, dest, src, |addr, _| {
        get_enum_tag(addr) as usize
    });
}

fn multi_payload_enum_generic_assign(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let tag_bytes = unsafe { reader.read::<usize>() };
    multi_payload_assign_body(md, reader, addr_offset, dest, src, |addr, enum_size| unsafe {
        read_tag_bytes(addr.add(enum_size - tag_bytes), tag_bytes) as usize
    });
}

fn multi_payload_assign_body(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8,
    src: *mut u8, get_tag: impl Fn(*const u8, usize) -> usize,
) {
    let num_payloads = unsafe { reader.read::<usize>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let enum_size = unsafe { reader.read::<usize>() };
    let nested = *reader;
    let nested_offset = *addr_offset;

    let src_tag = get_tag(unsafe { src.add(*addr_offset) }, enum_size);
    let dest_tag = get_tag(unsafe { dest.add(*addr_offset) }, enum_size);
    reader.skip(ref_count_bytes + num_payloads * WORD);

    if src_tag < num_payloads && dest_tag < num_payloads {
        *addr_offset += enum_size;
        let src_payload_offset = unsafe { nested.peek::<usize>(src_tag * WORD) };
        let dest_payload_offset = unsafe { nested.peek::<usize>(dest_tag * WORD) };
        let mut src_reader = nested;
        let mut dest_reader = nested;
        src_reader.skip(num_payloads * WORD + src_payload_offset);
        dest_reader.skip(num_payloads * WORD + dest_payload_offset);
        let mut dest_offset = nested_offset;
        let mut src_offset = nested_offset;
        drive_destroy(md, &mut dest_reader, &mut dest_offset, dest);
        drive_init_with_copy(md, &mut src_reader, &mut src_offset, dest, src);
        let trailing = *addr_offset - src_offset;
        if trailing != 0 {
            unsafe { copy_value_bytes(dest.add(src_offset), src.add(src_offset), trailing) };
        }
        return;
    } else if src_tag < num_payloads {
        *addr_offset += enum_size;
        let payload_offset = unsafe { nested.peek::<usize>(src_tag * WORD) };
        let mut src_reader = nested;
        src_reader.skip(num_payloads * WORD + payload_offset);
        let mut src_offset = nested_offset;
        drive_init_with_copy(md, &mut src_reader, &mut src_offset, dest, src);
        let trailing = *addr_offset - src_offset;
        if trailing != 0 {
            unsafe { copy_value_bytes(dest.add(src_offset), src.add(src_offset), trailing) };
        }
        return;
    } else if dest_tag < num_payloads {
        let payload_offset = unsafe { nested.peek::<usize>(dest_tag * WORD) };
        let mut dest_reader = nested;
        dest_reader.skip(num_payloads * WORD + payload_offset);
        let mut dest_offset = nested_offset;
        drive_destroy(md, &mut dest_reader, &mut dest_offset, dest);
    }

    unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), enum_size) };
    *addr_offset += enum_size;
}

pub(crate) static ASSIGN_WITH_COPY_TABLE: [PairStepFn; NUM_KINDS] = [
    end_marker,
    error_assign,
    native_strong_assign,
    unowned_assign,
    weak_assign,
    unknown_assign,
    unknown_unowned_assign,
    unknown_weak_assign,
    bridge_assign,
    block_assign,
    objc_strong_assign,
    reserved_kind_pair, // Custom
    metatype_assign,
    reserved_kind_pair, // Generic
    existential_assign,
    resilient_assign,
    single_payload_enum_simple_assign,
    single_payload_enum_fn_assign,
    single_payload_enum_fn_resolved_assign,
    single_payload_enum_generic_assign,
    multi_payload_enum_fn_assign,
    multi_payload_enum_fn_resolved_assign,
    multi_payload_enum_generic_assign,
];

pub(crate) fn drive_assign_with_copy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    loop {
        let (kind, gap) = split_instruction_word(unsafe { reader.read::<u64>() });
        unsafe { copy_gap(dest, src, *addr_offset, gap as usize) };
        *addr_offset += gap as usize;
        if kind == RefKind::End as u8 {
            return;
        }
        let step = ASSIGN_WITH_COPY_TABLE
            .get(kind as usize)
            .unwrap_or_else(|| panic!("unknown layout instruction kind {kind:#04x}"));
        step(md, reader, addr_offset, dest, src);
    }
}
