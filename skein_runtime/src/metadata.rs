use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use skein_types::layout::{LAYOUT_HEADER_BYTES, VALUE_BUFFER_WORDS};
use skein_types::WitnessFlags;

use crate::host::HostOps;
use crate::reader::LayoutReader;

/// Fixed-size inline storage of an existential container. The container is
/// this buffer followed by one word naming the contained type's descriptor.
#[repr(C)]
pub struct ValueBuffer {
    pub words: [*mut u8; VALUE_BUFFER_WORDS],
}

/// A single witness-table entry for a type.
/// **MUST BE KEPT IN SYNC WITH THE HOST'S TABLE LAYOUT**; generated code
/// emits these as plain data.
#[repr(C)]
pub struct WitnessTable {
    pub size: usize,
    pub flags: WitnessFlags,
    pub extra_inhabitants: u32,
    pub destroy: extern "C" fn(*mut u8, *const TypeDesc),
    pub init_with_copy: extern "C" fn(*mut u8, *const u8, *const TypeDesc) -> *mut u8,
    pub init_with_take: extern "C" fn(*mut u8, *mut u8, *const TypeDesc) -> *mut u8,
    pub assign_with_copy: extern "C" fn(*mut u8, *const u8, *const TypeDesc) -> *mut u8,
    pub assign_with_take: extern "C" fn(*mut u8, *mut u8, *const TypeDesc) -> *mut u8,
    pub init_buffer_with_copy_of_buffer:
        extern "C" fn(*mut ValueBuffer, *mut ValueBuffer, *const TypeDesc) -> *mut u8,
    pub get_enum_tag_single_payload: extern "C" fn(*const u8, u32, *const TypeDesc) -> u32,
    pub store_enum_tag_single_payload: extern "C" fn(*mut u8, u32, u32, *const TypeDesc),
}

/// Runtime type descriptor. The layout string is attached once by
/// [`sk_instantiate_layout_string`] (or rewritten in place by the resolution
/// pass) and published with a release store so drivers that observe the
/// pointer also observe its bytes.
#[repr(C)]
pub struct TypeDesc {
    pub witnesses: &'static WitnessTable,
    layout: AtomicPtr<u8>,
    pub generic_args: *const *const TypeDesc,
    pub host: &'static HostOps,
}

impl TypeDesc {
    pub fn new(witnesses: &'static WitnessTable, host: &'static HostOps) -> Self {
        Self {
            witnesses,
            layout: AtomicPtr::new(ptr::null_mut()),
            generic_args: ptr::null(),
            host,
        }
    }

    pub fn with_generic_args(
        witnesses: &'static WitnessTable, host: &'static HostOps,
        generic_args: *const *const TypeDesc,
    ) -> Self {
        Self {
            witnesses,
            layout: AtomicPtr::new(ptr::null_mut()),
            generic_args,
            host,
        }
    }

    pub fn size(&self) -> usize {
        self.witnesses.size
    }

    pub fn flags(&self) -> WitnessFlags {
        self.witnesses.flags
    }

    pub fn extra_inhabitants(&self) -> u32 {
        self.witnesses.extra_inhabitants
    }

    pub fn set_layout_string(&self, layout: *const u8) {
        self.layout.store(layout as *mut u8, Ordering::Release);
    }

    pub fn layout_string(&self) -> *const u8 {
        let p = self.layout.load(Ordering::Acquire);
        assert!(!p.is_null(), "type descriptor has no layout string attached");
        p
    }

    /// Reader positioned at the first instruction, past the header.
    pub(crate) fn instruction_reader(&self) -> LayoutReader {
        LayoutReader::new(unsafe { self.layout_string().add(LAYOUT_HEADER_BYTES) })
    }

    pub fn vw_destroy(&self, addr: *mut u8) {
        (self.witnesses.destroy)(addr, self)
    }

    pub fn vw_init_with_copy(&self, dest: *mut u8, src: *const u8) {
        (self.witnesses.init_with_copy)(dest, src, self);
    }

    pub fn vw_init_with_take(&self, dest: *mut u8, src: *mut u8) {
        (self.witnesses.init_with_take)(dest, src, self);
    }

    pub fn vw_assign_with_copy(&self, dest: *mut u8, src: *const u8) {
        (self.witnesses.assign_with_copy)(dest, src, self);
    }

    pub fn vw_init_buffer_with_copy_of_buffer(
        &self, dest: *mut ValueBuffer, src: *mut ValueBuffer,
    ) -> *mut u8 {
        (self.witnesses.init_buffer_with_copy_of_buffer)(dest, src, self)
    }

    pub fn vw_get_enum_tag_single_payload(&self, addr: *const u8, num_empty_cases: u32) -> u32 {
        (self.witnesses.get_enum_tag_single_payload)(addr, num_empty_cases, self)
    }

    pub fn vw_store_enum_tag_single_payload(&self, addr: *mut u8, tag: u32, num_empty_cases: u32) {
        (self.witnesses.store_enum_tag_single_payload)(addr, tag, num_empty_cases, self)
    }
}

/// Reads the contained type of an existential container from the word after
/// its inline buffer.
///
/// # Safety
/// `object` must point at a live existential container.
pub(crate) unsafe fn existential_type_desc<'a>(object: *const u8) -> &'a TypeDesc {
    let slot = (object as *const *const TypeDesc).add(VALUE_BUFFER_WORDS);
    &*ptr::read_unaligned(slot)
}

/// Attaches a layout string to a type descriptor.
///
/// # Safety
/// `layout` must point at a complete layout string that outlives the
/// descriptor; `ty` must be a valid descriptor pointer.
#[no_mangle]
pub unsafe extern "C" fn sk_instantiate_layout_string(layout: *const u8, ty: *const TypeDesc) {
    (*ty).set_layout_string(layout);
}
