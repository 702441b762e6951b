//! The four traversal drivers and their C-callable entry points.
//!
//! A driver is a loop over tagged instruction words: advance the value cursor
//! by the instruction's gap (bulk-copying it for copy flavors), then dispatch
//! the kind byte through that flavor's primitive table. Enum handlers recurse
//! back into the drivers for payload sub-streams.

mod assign;
mod destroy;
mod pair;

use skein_types::layout::WORD;

use crate::host::HeapObject;
use crate::metadata::{TypeDesc, ValueBuffer};
use crate::reader::{copy_value_bytes, LayoutReader};

pub(crate) use assign::drive_assign_with_copy;
pub(crate) use destroy::drive_destroy;
pub(crate) use pair::{drive_init_with_copy, drive_init_with_take};

pub(crate) type GetEnumTagFn = extern "C" fn(*const u8) -> u32;
pub(crate) type MetadataAccessor = extern "C" fn(*const *const TypeDesc) -> *const TypeDesc;

/// Dispatch step shared by the unary (destroy) tables.
pub(crate) type UnaryStepFn = fn(&TypeDesc, &mut LayoutReader, &mut usize, *mut u8);
/// Dispatch step shared by the binary (dest, src) tables. Copy flavors never
/// write through `src`; take and assign flavors may.
pub(crate) type PairStepFn = fn(&TypeDesc, &mut LayoutReader, &mut usize, *mut u8, *mut u8);

pub(crate) unsafe fn load_word(addr: *const u8, off: usize) -> usize {
    std::ptr::read_unaligned(addr.add(off) as *const usize)
}

pub(crate) unsafe fn store_word(addr: *mut u8, off: usize, v: usize) {
    std::ptr::write_unaligned(addr.add(off) as *mut usize, v);
}

/// Invokes the embedded accessor with the enclosing type's generic arguments
/// to obtain the dynamically-resolved field type.
pub(crate) unsafe fn resilient_type_desc<'a>(
    md: &TypeDesc, reader: &mut LayoutReader,
) -> &'a TypeDesc {
    let accessor: MetadataAccessor = crate::reader::read_relative_fn(reader);
    &*accessor(md.generic_args)
}

pub(crate) fn reserved_kind(_: &TypeDesc, _: &mut LayoutReader, _: &mut usize, _: *mut u8) {
    panic!("reserved layout instruction kind in stream");
}

pub(crate) fn reserved_kind_pair(
    _: &TypeDesc, _: &mut LayoutReader, _: &mut usize, _: *mut u8, _: *mut u8,
) {
    panic!("reserved layout instruction kind in stream");
}

/// # Safety
/// `value` must point at an initialized value of `metadata`'s type.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_destroy(value: *mut u8, metadata: *const TypeDesc) {
    let md = &*metadata;
    let mut reader = md.instruction_reader();
    let mut addr_offset = 0usize;
    drive_destroy(md, &mut reader, &mut addr_offset, value);
}

/// # Safety
/// As [`sk_generic_destroy`], with `count` elements of `stride` bytes.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_array_destroy(
    value: *mut u8, count: usize, stride: usize, metadata: *const TypeDesc,
) {
    let md = &*metadata;
    for i in 0..count {
        let mut reader = md.instruction_reader();
        let mut addr_offset = i * stride;
        drive_destroy(md, &mut reader, &mut addr_offset, value);
    }
}

/// # Safety
/// `dest` must be uninitialized storage and `src` an initialized value, both
/// of `metadata`'s size.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_init_with_copy(
    dest: *mut u8, src: *const u8, metadata: *const TypeDesc,
) -> *mut u8 {
    let md = &*metadata;
    let mut reader = md.instruction_reader();
    let mut addr_offset = 0usize;
    drive_init_with_copy(md, &mut reader, &mut addr_offset, dest, src as *mut u8);
    debug_assert_eq!(addr_offset, md.size());
    dest
}

/// # Safety
/// As [`sk_generic_init_with_copy`].
#[no_mangle]
pub unsafe extern "C" fn sk_generic_array_init_with_copy(
    dest: *mut u8, src: *const u8, count: usize, stride: usize, metadata: *const TypeDesc,
) {
    let md = &*metadata;
    for i in 0..count {
        let mut reader = md.instruction_reader();
        let mut addr_offset = i * stride;
        drive_init_with_copy(md, &mut reader, &mut addr_offset, dest, src as *mut u8);
    }
}

/// # Safety
/// `dest` must be uninitialized storage; `src` is consumed and left
/// deinitialized.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_init_with_take(
    dest: *mut u8, src: *mut u8, metadata: *const TypeDesc,
) -> *mut u8 {
    let md = &*metadata;
    if md.flags().is_bitwise_takable() {
        copy_value_bytes(dest, src, md.size());
        return dest;
    }

    let mut reader = md.instruction_reader();
    let mut addr_offset = 0usize;
    drive_init_with_take(md, &mut reader, &mut addr_offset, dest, src);
    debug_assert_eq!(addr_offset, md.size());
    dest
}

/// # Safety
/// `dest` and `src` must both be initialized values of `metadata`'s type.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_assign_with_copy(
    dest: *mut u8, src: *const u8, metadata: *const TypeDesc,
) -> *mut u8 {
    let md = &*metadata;
    let mut reader = md.instruction_reader();
    let mut addr_offset = 0usize;
    drive_assign_with_copy(md, &mut reader, &mut addr_offset, dest, src as *mut u8);
    debug_assert_eq!(addr_offset, md.size());
    dest
}

/// # Safety
/// As [`sk_generic_assign_with_copy`].
#[no_mangle]
pub unsafe extern "C" fn sk_generic_array_assign_with_copy(
    dest: *mut u8, src: *const u8, count: usize, stride: usize, metadata: *const TypeDesc,
) {
    let md = &*metadata;
    for i in 0..count {
        let mut reader = md.instruction_reader();
        let mut addr_offset = i * stride;
        drive_assign_with_copy(md, &mut reader, &mut addr_offset, dest, src as *mut u8);
    }
}

/// Retire-then-move: destroying the old destination first means no separate
/// assign-with-take traversal exists.
///
/// # Safety
/// `dest` must be initialized; `src` is consumed.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_assign_with_take(
    dest: *mut u8, src: *mut u8, metadata: *const TypeDesc,
) -> *mut u8 {
    sk_generic_destroy(dest, metadata);
    sk_generic_init_with_take(dest, src, metadata)
}

/// Copies a value buffer. Inline values copy like plain storage; out-of-line
/// values share the heap box and retain it. Returns the address of the inner
/// value.
///
/// # Safety
/// Both buffers must belong to `metadata`'s type; `src` must be initialized.
#[no_mangle]
pub unsafe extern "C" fn sk_generic_init_buffer_with_copy_of_buffer(
    dest: *mut ValueBuffer, src: *mut ValueBuffer, metadata: *const TypeDesc,
) -> *mut u8 {
    let md = &*metadata;
    if md.flags().is_value_inline() {
        sk_generic_init_with_copy(dest as *mut u8, src as *const u8, metadata)
    } else {
        let heap_box = load_word(src as *const u8, 0);
        store_word(dest as *mut u8, 0, heap_box);
        (md.host.strong_retain)(heap_box as *mut HeapObject);
        (heap_box as *mut u8).wrapping_add(md.host.box_value_offset)
    }
}

/// Gap handling shared by the copy-flavored drivers: bulk-copy the
/// bit-copyable bytes between reference fields, then advance.
#[inline]
pub(crate) unsafe fn copy_gap(dest: *mut u8, src: *const u8, addr_offset: usize, gap: usize) {
    if gap != 0 {
        copy_value_bytes(dest.add(addr_offset), src.add(addr_offset), gap);
    }
}

/// Fallback for kinds with no take entry: the reference word is trivially
/// movable, so take degenerates to a one-word copy.
#[inline]
pub(crate) unsafe fn take_word(dest: *mut u8, src: *const u8, addr_offset: &mut usize) {
    let off = *addr_offset;
    copy_value_bytes(dest.add(off), src.add(off), WORD);
    *addr_offset = off + WORD;
}
