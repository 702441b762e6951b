//! Shared test plumbing: a host-operations table that logs every collaborator
//! call per thread, plus helpers for leaking descriptors and layout strings
//! with stable addresses.

use std::cell::RefCell;

use skein_types::builder::LayoutString;
use skein_types::WitnessFlags;

use crate::host::{HeapObject, HostOps, UnownedSlot, WeakSlot};
use crate::interp::{
    sk_generic_assign_with_copy, sk_generic_assign_with_take, sk_generic_destroy,
    sk_generic_init_buffer_with_copy_of_buffer, sk_generic_init_with_copy,
    sk_generic_init_with_take,
};
use crate::metadata::{TypeDesc, ValueBuffer, WitnessTable};

pub(crate) const SPARE_BITS: usize = 0x7;
pub(crate) const RESERVED_BITS: usize = 1 << 63;
pub(crate) const BOX_VALUE_OFFSET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostOp {
    StrongRetain(usize),
    StrongRelease(usize),
    UnownedRetain(usize),
    UnownedRelease(usize),
    WeakCopyInit(usize, usize),
    WeakCopyAssign(usize, usize),
    WeakDestroy(usize),
    UnknownRetain(usize),
    UnknownRelease(usize),
    UnknownUnownedCopyInit(usize, usize),
    UnknownUnownedCopyAssign(usize, usize),
    UnknownUnownedDestroy(usize),
    UnknownWeakCopyInit(usize, usize),
    UnknownWeakCopyAssign(usize, usize),
    UnknownWeakTakeInit(usize, usize),
    UnknownWeakDestroy(usize),
    BridgeRetain(usize),
    BridgeRelease(usize),
    ErrorRetain(usize),
    ErrorRelease(usize),
    BlockCopy(usize),
    BlockRelease(usize),
    ForeignRetain(usize),
    ForeignRelease(usize),
}

thread_local! {
    static HOST_LOG: RefCell<Vec<HostOp>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn reset_log() {
    HOST_LOG.with(|l| l.borrow_mut().clear());
}

pub(crate) fn take_log() -> Vec<HostOp> {
    HOST_LOG.with(|l| std::mem::take(&mut *l.borrow_mut()))
}

fn log(op: HostOp) {
    HOST_LOG.with(|l| l.borrow_mut().push(op));
}

macro_rules! ref_op {
    ($name:ident, $variant:ident) => {
        extern "C" fn $name(object: *mut HeapObject) {
            log(HostOp::$variant(object as usize));
        }
    };
}

macro_rules! weak_pair_op {
    ($name:ident, $variant:ident) => {
        extern "C" fn $name(dest: *mut WeakSlot, src: *mut WeakSlot) {
            unsafe { (*dest).value = (*src).value };
            log(HostOp::$variant(dest as usize, src as usize));
        }
    };
}

macro_rules! unowned_pair_op {
    ($name:ident, $variant:ident) => {
        extern "C" fn $name(dest: *mut UnownedSlot, src: *mut UnownedSlot) {
            unsafe { (*dest).value = (*src).value };
            log(HostOp::$variant(dest as usize, src as usize));
        }
    };
}

ref_op!(strong_retain, StrongRetain);
ref_op!(strong_release, StrongRelease);
ref_op!(unowned_retain, UnownedRetain);
ref_op!(unowned_release, UnownedRelease);
ref_op!(unknown_retain, UnknownRetain);
ref_op!(unknown_release, UnknownRelease);
ref_op!(bridge_retain, BridgeRetain);
ref_op!(bridge_release, BridgeRelease);
ref_op!(error_retain, ErrorRetain);
ref_op!(error_release, ErrorRelease);
ref_op!(foreign_retain, ForeignRetain);
ref_op!(foreign_release, ForeignRelease);

weak_pair_op!(weak_copy_init, WeakCopyInit);
weak_pair_op!(weak_copy_assign, WeakCopyAssign);
weak_pair_op!(unknown_weak_copy_init, UnknownWeakCopyInit);
weak_pair_op!(unknown_weak_copy_assign, UnknownWeakCopyAssign);
weak_pair_op!(unknown_weak_take_init, UnknownWeakTakeInit);
unowned_pair_op!(unknown_unowned_copy_init, UnknownUnownedCopyInit);
unowned_pair_op!(unknown_unowned_copy_assign, UnknownUnownedCopyAssign);

extern "C" fn weak_destroy(slot: *mut WeakSlot) {
    log(HostOp::WeakDestroy(slot as usize));
}

extern "C" fn unknown_weak_destroy(slot: *mut WeakSlot) {
    log(HostOp::UnknownWeakDestroy(slot as usize));
}

extern "C" fn unknown_unowned_destroy(slot: *mut UnownedSlot) {
    log(HostOp::UnknownUnownedDestroy(slot as usize));
}

extern "C" fn block_copy(block: *mut u8) -> *mut u8 {
    log(HostOp::BlockCopy(block as usize));
    block
}

extern "C" fn block_release(block: *mut u8) {
    log(HostOp::BlockRelease(block as usize));
}

pub(crate) static TEST_HOST: HostOps = HostOps {
    spare_bits_mask: SPARE_BITS,
    reserved_bits_mask: RESERVED_BITS,
    box_value_offset: BOX_VALUE_OFFSET,
    strong_retain,
    strong_release,
    unowned_retain,
    unowned_release,
    weak_copy_init,
    weak_copy_assign,
    weak_destroy,
    unknown_retain,
    unknown_release,
    unknown_unowned_copy_init,
    unknown_unowned_copy_assign,
    unknown_unowned_destroy,
    unknown_weak_copy_init,
    unknown_weak_copy_assign,
    unknown_weak_take_init,
    unknown_weak_destroy,
    bridge_retain,
    bridge_release,
    error_retain,
    error_release,
    block_copy,
    block_release,
    foreign_retain,
    foreign_release,
};

// Safe wrappers so witness tables can point at the generic entry points.

extern "C" fn generic_destroy(addr: *mut u8, md: *const TypeDesc) {
    unsafe { sk_generic_destroy(addr, md) }
}

extern "C" fn generic_init_with_copy(dest: *mut u8, src: *const u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { sk_generic_init_with_copy(dest, src, md) }
}

extern "C" fn generic_init_with_take(dest: *mut u8, src: *mut u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { sk_generic_init_with_take(dest, src, md) }
}

extern "C" fn generic_assign_with_copy(
    dest: *mut u8, src: *const u8, md: *const TypeDesc,
) -> *mut u8 {
    unsafe { sk_generic_assign_with_copy(dest, src, md) }
}

extern "C" fn generic_assign_with_take(dest: *mut u8, src: *mut u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { sk_generic_assign_with_take(dest, src, md) }
}

extern "C" fn generic_init_buffer(
    dest: *mut ValueBuffer, src: *mut ValueBuffer, md: *const TypeDesc,
) -> *mut u8 {
    unsafe { sk_generic_init_buffer_with_copy_of_buffer(dest, src, md) }
}

extern "C" fn no_enum_tag(_addr: *const u8, _cases: u32, _md: *const TypeDesc) -> u32 {
    panic!("type has no single-payload tag witness");
}

extern "C" fn no_store_enum_tag(_addr: *mut u8, _tag: u32, _cases: u32, _md: *const TypeDesc) {
    panic!("type has no single-payload tag witness");
}

fn leak_generic_witnesses(size: usize, flag_bits: u32) -> &'static WitnessTable {
    Box::leak(Box::new(WitnessTable {
        size,
        flags: WitnessFlags::new(flag_bits),
        extra_inhabitants: 0,
        destroy: generic_destroy,
        init_with_copy: generic_init_with_copy,
        init_with_take: generic_init_with_take,
        assign_with_copy: generic_assign_with_copy,
        assign_with_take: generic_assign_with_take,
        init_buffer_with_copy_of_buffer: generic_init_buffer,
        get_enum_tag_single_payload: no_enum_tag,
        store_enum_tag_single_payload: no_store_enum_tag,
    }))
}

/// Leaks a descriptor whose witnesses drive the generic entry points over
/// `layout`. The leak keeps descriptor, witness table, and layout string at
/// stable addresses for the life of the test process.
pub(crate) fn leak_generic_type(
    size: usize, flag_bits: u32, layout: LayoutString,
) -> &'static TypeDesc {
    let ptr = leak_layout(layout);
    leak_generic_type_raw(size, flag_bits, ptr)
}

/// As [`leak_generic_type`] but over an already-pinned layout string, so the
/// caller can keep a mutable alias for the resolution pass.
pub(crate) fn leak_generic_type_raw(
    size: usize, flag_bits: u32, layout: *const u8,
) -> &'static TypeDesc {
    let witnesses = leak_generic_witnesses(size, flag_bits);
    let desc: &'static TypeDesc = Box::leak(Box::new(TypeDesc::new(witnesses, &TEST_HOST)));
    desc.set_layout_string(layout);
    desc
}

/// Descriptor carrying a generic-argument vector, for resilient-field tests.
pub(crate) fn leak_generic_type_with_args(
    size: usize, flag_bits: u32, layout: *const u8, args: Vec<*const TypeDesc>,
) -> &'static TypeDesc {
    let witnesses = leak_generic_witnesses(size, flag_bits);
    let args: &'static [*const TypeDesc] = Box::leak(args.into_boxed_slice());
    let desc: &'static TypeDesc = Box::leak(Box::new(TypeDesc::with_generic_args(
        witnesses,
        &TEST_HOST,
        args.as_ptr(),
    )));
    desc.set_layout_string(layout);
    desc
}

pub(crate) fn leak_layout(layout: LayoutString) -> *const u8 {
    let ptr = layout.as_ptr();
    std::mem::forget(layout);
    ptr
}

/// Mutable flavor for resolution-pass tests.
pub(crate) fn leak_layout_mut(mut layout: LayoutString) -> *mut u8 {
    let ptr = layout.as_mut_ptr();
    std::mem::forget(layout);
    ptr
}

// A word-sized test type whose extra inhabitants are the values
// 1..=extra_inhabitants stored in its low 32 bits; tag witnesses read and
// write that field directly.

extern "C" fn xi_word_get_tag(addr: *const u8, _cases: u32, _md: *const TypeDesc) -> u32 {
    let mut out = [0u8; 4];
    unsafe { std::ptr::copy_nonoverlapping(addr, out.as_mut_ptr(), 4) };
    u32::from_ne_bytes(out)
}

extern "C" fn xi_word_store_tag(addr: *mut u8, tag: u32, _cases: u32, _md: *const TypeDesc) {
    unsafe { std::ptr::copy_nonoverlapping(tag.to_ne_bytes().as_ptr(), addr, 4) };
}

extern "C" fn pod_destroy(_addr: *mut u8, _md: *const TypeDesc) {}

extern "C" fn pod_init_with_copy(dest: *mut u8, src: *const u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { std::ptr::copy_nonoverlapping(src, dest, (*md).size()) };
    dest
}

extern "C" fn pod_init_with_take(dest: *mut u8, src: *mut u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { std::ptr::copy_nonoverlapping(src, dest, (*md).size()) };
    dest
}

extern "C" fn pod_assign_with_copy(dest: *mut u8, src: *const u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { std::ptr::copy_nonoverlapping(src, dest, (*md).size()) };
    dest
}

extern "C" fn pod_assign_with_take(dest: *mut u8, src: *mut u8, md: *const TypeDesc) -> *mut u8 {
    unsafe { std::ptr::copy_nonoverlapping(src, dest, (*md).size()) };
    dest
}

extern "C" fn pod_init_buffer(
    dest: *mut ValueBuffer, src: *mut ValueBuffer, md: *const TypeDesc,
) -> *mut u8 {
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, (*md).size()) };
    dest as *mut u8
}

/// Leaks a trivial word type carrying the XI tag witnesses, for generic
/// single-payload enum tests.
pub(crate) fn leak_xi_word_type(extra_inhabitants: u32) -> &'static TypeDesc {
    let witnesses: &'static WitnessTable = Box::leak(Box::new(WitnessTable {
        size: skein_types::layout::WORD,
        flags: WitnessFlags::new(skein_types::flags::IS_BITWISE_TAKABLE),
        extra_inhabitants,
        destroy: pod_destroy,
        init_with_copy: pod_init_with_copy,
        init_with_take: pod_init_with_take,
        assign_with_copy: pod_assign_with_copy,
        assign_with_take: pod_assign_with_take,
        init_buffer_with_copy_of_buffer: pod_init_buffer,
        get_enum_tag_single_payload: xi_word_get_tag,
        store_enum_tag_single_payload: xi_word_store_tag,
    }));
    Box::leak(Box::new(TypeDesc::new(witnesses, &TEST_HOST)))
}
