//! Copy- and take-initialization traversals.
//!
//! Both flavors share the single-payload enum handlers (which only bit-copy
//! and skip); the multi-payload handlers are generic over the driver they
//! re-enter for the active payload's sub-stream.

use skein_types::kind::NUM_KINDS;
use skein_types::layout::{
    self, split_instruction_word, tag_bytes_for_pattern, VALUE_BUFFER_WORDS, WORD,
};
use skein_types::RefKind;

use crate::host::{HeapObject, UnownedSlot, WeakSlot};
use crate::metadata::{existential_type_desc, TypeDesc, ValueBuffer};
use crate::reader::{copy_value_bytes, read_relative_fn, read_tag_bytes, LayoutReader};

use super::{
    copy_gap, load_word, reserved_kind_pair, resilient_type_desc, store_word, take_word,
    GetEnumTagFn, PairStepFn,
};

fn end_marker(_: &TypeDesc, _: &mut LayoutReader, _: &mut usize, _: *mut u8, _: *mut u8) {}

fn error_retain(md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8) {
    let off = *addr_offset;
    let object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, object) };
    *addr_offset = off + WORD;
    (md.host.error_retain)(object as *mut HeapObject);
}

fn native_strong_retain(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, object) };
    *addr_offset = off + WORD;
    (md.host.strong_retain)((object & !md.host.spare_bits_mask) as *mut HeapObject);
}

fn unowned_retain(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, object) };
    *addr_offset = off + WORD;
    (md.host.unowned_retain)((object & !md.host.spare_bits_mask) as *mut HeapObject);
}

fn weak_copy_init(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.weak_copy_init)(
        unsafe { dest.add(off) } as *mut WeakSlot,
        unsafe { src.add(off) } as *mut WeakSlot,
    );
}

fn unknown_retain(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, object) };
    *addr_offset = off + WORD;
    (md.host.unknown_retain)(object as *mut HeapObject);
}

fn unknown_unowned_copy_init(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.unknown_unowned_copy_init)(
        unsafe { dest.add(off) } as *mut UnownedSlot,
        unsafe { src.add(off) } as *mut UnownedSlot,
    );
}

fn unknown_weak_copy_init(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.unknown_weak_copy_init)(
        unsafe { dest.add(off) } as *mut WeakSlot,
        unsafe { src.add(off) } as *mut WeakSlot,
    );
}

fn unknown_weak_take_init(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    *addr_offset = off + WORD;
    (md.host.unknown_weak_take_init)(
        unsafe { dest.add(off) } as *mut WeakSlot,
        unsafe { src.add(off) } as *mut WeakSlot,
    );
}

fn bridge_retain(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, object) };
    *addr_offset = off + WORD;
    (md.host.bridge_retain)(object as *mut HeapObject);
}

fn block_copy(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let copy = (md.host.block_copy)(unsafe { load_word(src, off) } as *mut u8);
    unsafe { store_word(dest, off, copy as usize) };
    *addr_offset = off + WORD;
}

fn objc_strong_retain(
    md: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let object = unsafe { load_word(src, off) };
    unsafe { store_word(dest, off, object) };
    *addr_offset = off + WORD;
    if object & md.host.reserved_bits_mask != 0 {
        return;
    }
    (md.host.foreign_retain)((object & !md.host.spare_bits_mask) as *mut HeapObject);
}

fn metatype_init_with_copy(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { &*reader.read::<*const TypeDesc>() };
    *addr_offset = off + ty.size();
    ty.vw_init_with_copy(unsafe { dest.add(off) }, unsafe { src.add(off) });
}

fn metatype_init_with_take(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { &*reader.read::<*const TypeDesc>() };
    *addr_offset = off + ty.size();
    ty.vw_init_with_take(unsafe { dest.add(off) }, unsafe { src.add(off) });
}

fn existential_init_with_copy(
    _: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { existential_type_desc(src.add(off)) };
    *addr_offset = off + WORD * VALUE_BUFFER_WORDS;
    ty.vw_init_buffer_with_copy_of_buffer(
        unsafe { dest.add(off) } as *mut ValueBuffer,
        unsafe { src.add(off) } as *mut ValueBuffer,
    );
}

fn existential_init_with_take(
    _: &TypeDesc, _: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { existential_type_desc(src.add(off)) };
    *addr_offset = off + WORD * VALUE_BUFFER_WORDS;
    if ty.flags().is_value_inline() {
        ty.vw_init_with_take(unsafe { dest.add(off) }, unsafe { src.add(off) });
    } else {
        unsafe { copy_value_bytes(dest.add(off), src.add(off), WORD) };
    }
}

fn resilient_init_with_copy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { resilient_type_desc(md, reader) };
    *addr_offset = off + ty.size();
    ty.vw_init_with_copy(unsafe { dest.add(off) }, unsafe { src.add(off) });
}

fn resilient_init_with_take(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let off = *addr_offset;
    let ty = unsafe { resilient_type_desc(md, reader) };
    *addr_offset = off + ty.size();
    ty.vw_init_with_take(unsafe { dest.add(off) }, unsafe { src.add(off) });
}

fn single_payload_enum_simple_pair(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
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
            read_tag_bytes(src.add(*addr_offset + payload_size), extra_tag_bytes)
        };
        if tag != 0 {
            xi_tag_pattern = 0;
        }
    }

    if xi_tag_pattern != 0 {
        let xi_tag_bytes = tag_bytes_for_pattern(xi_tag_pattern);
        let tag = unsafe { read_tag_bytes(src.add(*addr_offset + xi_tag_offset), xi_tag_bytes) }
            .wrapping_sub(zero_tag);
        if tag >= xi_tag_values as u64 {
            return;
        }
    }

    unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), skip) };
    reader.skip(ref_count_bytes);
    *addr_offset += skip;
}

fn single_payload_enum_fn_pair(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag: GetEnumTagFn = unsafe { read_relative_fn(reader) };
    let tag = get_enum_tag(unsafe { src.add(*addr_offset) });

    if tag == 0 {
        reader.skip(2 * WORD);
    } else {
        let ref_count_bytes = unsafe { reader.read::<usize>() };
        let skip = unsafe { reader.read::<usize>() };
        reader.skip(ref_count_bytes);
        unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), skip) };
        *addr_offset += skip;
    }
}

fn single_payload_enum_fn_resolved_pair(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag = unsafe { reader.read::<GetEnumTagFn>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let skip = unsafe { reader.read::<usize>() };

    if get_enum_tag(unsafe { src.add(*addr_offset) }) != 0 {
        reader.skip(ref_count_bytes);
        unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), skip) };
        *addr_offset += skip;
    }
}

fn single_payload_enum_generic_pair(
    _: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
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
            read_tag_bytes(src.add(*addr_offset + payload_size), extra_tag_bytes)
        };
        if tag != 0 {
            xi_type = std::ptr::null();
        }
    }

    if !xi_type.is_null() {
        let ty = unsafe { &*xi_type };
        let tag = ty.vw_get_enum_tag_single_payload(
            unsafe { src.add(*addr_offset + xi_tag_offset) },
            num_empty_cases,
        );
        if tag == 0 {
            return;
        }
    }

    reader.skip(ref_count_bytes);
    unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), skip) };
    *addr_offset += skip;
}

/// Driver re-entered by multi-payload handlers for the active payload.
pub(crate) trait PairDriver {
    fn drive(
        md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8,
        src: *mut u8,
    );
}

pub(crate) struct InitWithCopy;

impl PairDriver for InitWithCopy {
    fn drive(
        md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8,
        src: *mut u8,
    ) {
        drive_init_with_copy(md, reader, addr_offset, dest, src);
    }
}

pub(crate) struct InitWithTake;

impl PairDriver for InitWithTake {
    fn drive(
        md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8,
        src: *mut u8,
    ) {
        drive_init_with_take(md, reader, addr_offset, dest, src);
    }
}

fn multi_payload_enum_fn_pair<D: PairDriver>(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag: GetEnumTagFn = unsafe { read_relative_fn(reader) };
    multi_payload_pair_body::<D>(md, reader, addr_offset, dest, src, get_enum_tag);
}

fn multi_payload_enum_fn_resolved_pair<D: PairDriver>(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let get_enum_tag = unsafe { reader.read::<GetEnumTagFn>() };
    multi_payload_pair_body::<D>(md, reader, addr_offset, dest, src, get_enum_tag);
}

fn multi_payload_pair_body<D: PairDriver>(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8,
    src: *mut u8, get_enum_tag: GetEnumTagFn,
) {
    let num_payloads = unsafe { reader.read::<usize>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let enum_size = unsafe { reader.read::<usize>() };
    let mut nested = *reader;
    let mut nested_offset = *addr_offset;

    let tag = get_enum_tag(unsafe { src.add(*addr_offset) }) as usize;
    reader.skip(ref_count_bytes + num_payloads * WORD);

    multi_payload_pair_dispatch::<D>(
        md, &mut nested, addr_offset, &mut nested_offset, dest, src, tag, num_payloads, enum_size,
    );
}

fn multi_payload_enum_generic_pair<D: PairDriver>(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    let tag_bytes = unsafe { reader.read::<usize>() };
    let num_payloads = unsafe { reader.read::<usize>() };
    let ref_count_bytes = unsafe { reader.read::<usize>() };
    let enum_size = unsafe { reader.read::<usize>() };
    let mut nested = *reader;
    let mut nested_offset = *addr_offset;

    let tag = unsafe {
        read_tag_bytes(src.add(*addr_offset + enum_size - tag_bytes), tag_bytes)
    } as usize;
    reader.skip(ref_count_bytes + num_payloads * WORD);

    multi_payload_pair_dispatch::<D>(
        md, &mut nested, addr_offset, &mut nested_offset, dest, src, tag, num_payloads, enum_size,
    );
}

#[allow(clippy::too_many_arguments)]
fn multi_payload_pair_dispatch<D: PairDriver>(
    md: &TypeDesc, nested: &mut LayoutReader, addr_offset: &mut usize, nested_offset: &mut usize,
    dest: *mut u8, src: *mut u8, tag: usize, num_payloads: usize, enum_size: usize,
) {
    if tag < num_payloads {
        *addr_offset += enum_size;
        let payload_offset = unsafe { nested.peek::<usize>(tag * WORD) };
        nested.skip(num_payloads * WORD + payload_offset);
        D::drive(md, nested, nested_offset, dest, src);
        let trailing = *addr_offset - *nested_offset;
        if trailing != 0 {
            unsafe { copy_value_bytes(dest.add(*nested_offset), src.add(*nested_offset), trailing) };
        }
    } else {
        unsafe { copy_value_bytes(dest.add(*addr_offset), src.add(*addr_offset), enum_size) };
        *addr_offset += enum_size;
    }
}

pub(crate) static INIT_WITH_COPY_TABLE: [PairStepFn; NUM_KINDS] = [
    end_marker,
    error_retain,
    native_strong_retain,
    unowned_retain,
    weak_copy_init,
    unknown_retain,
    unknown_unowned_copy_init,
    unknown_weak_copy_init,
    bridge_retain,
    block_copy,
    objc_strong_retain,
    reserved_kind_pair, // Custom
    metatype_init_with_copy,
    reserved_kind_pair, // Generic
    existential_init_with_copy,
    resilient_init_with_copy,
    single_payload_enum_simple_pair,
    single_payload_enum_fn_pair,
    single_payload_enum_fn_resolved_pair,
    single_payload_enum_generic_pair,
    multi_payload_enum_fn_pair::<InitWithCopy>,
    multi_payload_enum_fn_resolved_pair::<InitWithCopy>,
    multi_payload_enum_generic_pair::<InitWithCopy>,
];

/// Take steps; `None` means the kind's word is trivially movable and the
/// driver bit-copies it.
pub(crate) static INIT_WITH_TAKE_TABLE: [Option<PairStepFn>; NUM_KINDS] = [
    Some(end_marker),
    None, // Error
    None, // NativeStrong
    None, // Unowned
    None, // Weak
    None, // Unknown
    None, // UnknownUnowned
    Some(unknown_weak_take_init),
    None, // Bridge
    None, // Block
    None, // ObjcStrong
    Some(reserved_kind_pair), // Custom
    Some(metatype_init_with_take),
    Some(reserved_kind_pair), // Generic
    Some(existential_init_with_take),
    Some(resilient_init_with_take),
    Some(single_payload_enum_simple_pair),
    Some(single_payload_enum_fn_pair),
    Some(single_payload_enum_fn_resolved_pair),
    Some(single_payload_enum_generic_pair),
    Some(multi_payload_enum_fn_pair::<InitWithTake>),
    Some(multi_payload_enum_fn_resolved_pair::<InitWithTake>),
    Some(multi_payload_enum_generic_pair::<InitWithTake>),
];

pub(crate) fn drive_init_with_copy(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    loop {
        let (kind, gap) = split_instruction_word(unsafe { reader.read::<u64>() });
        unsafe { copy_gap(dest, src, *addr_offset, gap as usize) };
        *addr_offset += gap as usize;
        if kind == RefKind::End as u8 {
            return;
        }
        let step = INIT_WITH_COPY_TABLE
            .get(kind as usize)
            .unwrap_or_else(|| panic!("unknown layout instruction kind {kind:#04x}"));
        step(md, reader, addr_offset, dest, src);
    }
}

pub(crate) fn drive_init_with_take(
    md: &TypeDesc, reader: &mut LayoutReader, addr_offset: &mut usize, dest: *mut u8, src: *mut u8,
) {
    loop {
        let (kind, gap) = split_instruction_word(unsafe { reader.read::<u64>() });
        unsafe { copy_gap(dest, src, *addr_offset, gap as usize) };
        *addr_offset += gap as usize;
        if kind == RefKind::End as u8 {
            return;
        }
        let step = INIT_WITH_TAKE_TABLE
            .get(kind as usize)
            .unwrap_or_else(|| panic!("unknown layout instruction kind {kind:#04x}"));
        match step {
            Some(step) => step(md, reader, addr_offset, dest, src),
            None => unsafe { take_word(dest, src, addr_offset) },
        }
    }
}
