//! Compiler-side emission of layout strings.
//!
//! The builder writes the fixed header, then instructions in wire order.
//! Relative function-pointer slots can only be computed once the final buffer
//! address is known, so they are recorded as patch sites and filled in by
//! [`LayoutBuilder::finish`] after the buffer is pinned.

use byteorder::{ByteOrder, NativeEndian};

use crate::layout::{self, GAP_MASK, LAYOUT_HEADER_BYTES, WORD};
use crate::RefKind;

/// A finished, heap-pinned layout string. The buffer must not move once
/// relative pointers have been patched, so it is kept boxed.
pub struct LayoutString {
    bytes: Box<[u8]>,
}

impl LayoutString {
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// The resolution pass rewrites instructions in place.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimpleEnumParams {
    pub extra_tag_pattern: u8,
    pub xi_pattern: u8,
    pub xi_offset: u32,
    pub payload_size: usize,
    pub zero_tag_value: u64,
    pub xi_tag_values: usize,
    /// Bytes to advance over the whole enum on the empty-case path.
    pub skip: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GenericEnumParams {
    pub extra_tag_pattern: u8,
    pub xi_offset: u32,
    pub payload_size: usize,
    /// Address of the XI-hosting type's descriptor, or 0 for none.
    pub xi_type: usize,
    pub num_empty_cases: u32,
    pub skip: usize,
}

pub struct LayoutBuilder {
    buf: Vec<u8>,
    // (slot offset, absolute target) pairs resolved against the final base.
    rel_patches: Vec<(usize, usize)>,
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutBuilder {
    pub fn new() -> Self {
        let mut b = Self {
            buf: Vec::new(),
            rel_patches: Vec::new(),
        };
        // Header: flags word + instruction-stream byte count, patched in finish().
        b.word(0);
        b.word(0);
        b
    }

    fn word(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        NativeEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    fn size_word(&mut self, v: usize) {
        let mut tmp = [0u8; WORD];
        NativeEndian::write_uint(&mut tmp, v as u64, WORD);
        self.buf.extend_from_slice(&tmp);
    }

    fn u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        NativeEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    fn patch_size_word(&mut self, at: usize, v: usize) {
        NativeEndian::write_uint(&mut self.buf[at..at + WORD], v as u64, WORD);
    }

    fn rel_slot(&mut self, target: usize) {
        self.rel_patches.push((self.buf.len(), target));
        self.word(0);
    }

    /// Escape hatch for hand-assembled streams.
    pub fn raw_word(&mut self, v: u64) {
        self.word(v);
    }

    pub fn instruction(&mut self, kind: RefKind, gap: u64) {
        assert_eq!(gap & !GAP_MASK, 0, "in-value gap too large");
        self.word(layout::instruction_word(kind, gap));
    }

    pub fn end(&mut self, gap: u64) {
        self.instruction(RefKind::End, gap);
    }

    pub fn error(&mut self, gap: u64) {
        self.instruction(RefKind::Error, gap);
    }

    pub fn native_strong(&mut self, gap: u64) {
        self.instruction(RefKind::NativeStrong, gap);
    }

    pub fn unowned(&mut self, gap: u64) {
        self.instruction(RefKind::Unowned, gap);
    }

    pub fn weak(&mut self, gap: u64) {
        self.instruction(RefKind::Weak, gap);
    }

    pub fn unknown(&mut self, gap: u64) {
        self.instruction(RefKind::Unknown, gap);
    }

    pub fn unknown_unowned(&mut self, gap: u64) {
        self.instruction(RefKind::UnknownUnowned, gap);
    }

    pub fn unknown_weak(&mut self, gap: u64) {
        self.instruction(RefKind::UnknownWeak, gap);
    }

    pub fn bridge(&mut self, gap: u64) {
        self.instruction(RefKind::Bridge, gap);
    }

    pub fn block(&mut self, gap: u64) {
        self.instruction(RefKind::Block, gap);
    }

    pub fn objc_strong(&mut self, gap: u64) {
        self.instruction(RefKind::ObjcStrong, gap);
    }

    /// `desc` is the address of the field type's descriptor.
    pub fn metatype(&mut self, gap: u64, desc: usize) {
        self.instruction(RefKind::Metatype, gap);
        self.size_word(desc);
    }

    pub fn existential(&mut self, gap: u64) {
        self.instruction(RefKind::Existential, gap);
    }

    /// `accessor` is the address of the metadata accessor function; the slot
    /// is emitted as a self-relative offset.
    pub fn resilient(&mut self, gap: u64, accessor: usize) {
        self.instruction(RefKind::Resilient, gap);
        self.rel_slot(accessor);
    }

    /// Emits the header, then runs `payload` to emit the inline sub-stream
    /// (not End-terminated; the outer stream continues after it) and
    /// back-patches the sub-stream byte count.
    pub fn single_payload_enum_simple(
        &mut self, gap: u64, params: SimpleEnumParams, payload: impl FnOnce(&mut Self),
    ) {
        self.instruction(RefKind::SinglePayloadEnumSimple, gap);
        self.word(layout::byte_counts_and_offset(
            params.extra_tag_pattern,
            params.xi_pattern,
            params.xi_offset,
        ));
        self.size_word(params.payload_size);
        self.word(params.zero_tag_value);
        self.size_word(params.xi_tag_values);
        let len_at = self.buf.len();
        self.size_word(0);
        self.size_word(params.skip);
        self.inline_substream(len_at, payload);
    }

    pub fn single_payload_enum_fn(
        &mut self, gap: u64, tag_fn: usize, skip: usize, payload: impl FnOnce(&mut Self),
    ) {
        self.instruction(RefKind::SinglePayloadEnumFn, gap);
        self.rel_slot(tag_fn);
        let len_at = self.buf.len();
        self.size_word(0);
        self.size_word(skip);
        self.inline_substream(len_at, payload);
    }

    pub fn single_payload_enum_fn_resolved(
        &mut self, gap: u64, tag_fn: usize, skip: usize, payload: impl FnOnce(&mut Self),
    ) {
        self.instruction(RefKind::SinglePayloadEnumFnResolved, gap);
        self.size_word(tag_fn);
        let len_at = self.buf.len();
        self.size_word(0);
        self.size_word(skip);
        self.inline_substream(len_at, payload);
    }

    pub fn single_payload_enum_generic(
        &mut self, gap: u64, params: GenericEnumParams, payload: impl FnOnce(&mut Self),
    ) {
        self.instruction(RefKind::SinglePayloadEnumGeneric, gap);
        self.word(layout::byte_counts_and_offset(
            params.extra_tag_pattern,
            0,
            params.xi_offset,
        ));
        self.size_word(params.payload_size);
        self.size_word(params.xi_type);
        self.u32(params.num_empty_cases);
        let len_at = self.buf.len();
        self.size_word(0);
        self.size_word(params.skip);
        self.inline_substream(len_at, payload);
    }

    fn inline_substream(&mut self, len_at: usize, payload: impl FnOnce(&mut Self)) {
        let start = self.buf.len();
        payload(self);
        let len = self.buf.len() - start;
        self.patch_size_word(len_at, len);
    }

    pub fn multi_payload_enum_fn(
        &mut self, gap: u64, tag_fn: usize, enum_size: usize, payloads: &[&dyn Fn(&mut Self)],
    ) {
        self.instruction(RefKind::MultiPayloadEnumFn, gap);
        self.rel_slot(tag_fn);
        self.multi_payload_body(enum_size, payloads);
    }

    pub fn multi_payload_enum_fn_resolved(
        &mut self, gap: u64, tag_fn: usize, enum_size: usize, payloads: &[&dyn Fn(&mut Self)],
    ) {
        self.instruction(RefKind::MultiPayloadEnumFnResolved, gap);
        self.size_word(tag_fn);
        self.multi_payload_body(enum_size, payloads);
    }

    pub fn multi_payload_enum_generic(
        &mut self, gap: u64, tag_bytes: usize, enum_size: usize, payloads: &[&dyn Fn(&mut Self)],
    ) {
        self.instruction(RefKind::MultiPayloadEnumGeneric, gap);
        self.size_word(tag_bytes);
        self.multi_payload_body(enum_size, payloads);
    }

    /// Payload count, sub-stream byte count, enum size, per-payload offset
    /// table, then the End-terminated sub-streams. Table entries are offsets
    /// from the end of the table to each payload's sub-stream.
    fn multi_payload_body(&mut self, enum_size: usize, payloads: &[&dyn Fn(&mut Self)]) {
        self.size_word(payloads.len());
        let len_at = self.buf.len();
        self.size_word(0);
        self.size_word(enum_size);

        let table_at = self.buf.len();
        for _ in payloads {
            self.size_word(0);
        }

        let streams_start = self.buf.len();
        for (i, emit) in payloads.iter().enumerate() {
            let off = self.buf.len() - streams_start;
            self.patch_size_word(table_at + i * WORD, off);
            emit(self);
        }
        self.patch_size_word(len_at, self.buf.len() - streams_start);
    }

    pub fn finish(self) -> LayoutString {
        let Self { mut buf, rel_patches } = self;
        let stream_bytes = buf.len() - LAYOUT_HEADER_BYTES;
        NativeEndian::write_uint(&mut buf[8..8 + WORD], stream_bytes as u64, WORD);

        let mut bytes = buf.into_boxed_slice();
        let base = bytes.as_ptr() as usize;
        for (slot, target) in rel_patches {
            // TODO: emit a near trampoline when the target is beyond i32 range
            let delta = target as i64 - (base + slot) as i64;
            i32::try_from(delta).expect("relative pointer target out of range");
            NativeEndian::write_i64(&mut bytes[slot..slot + 8], delta);
        }
        LayoutString { bytes }
    }
}
