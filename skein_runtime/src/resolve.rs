//! One-shot resolution of PC-relative accessors embedded in layout strings.
//!
//! Rewrites `Resilient` instructions to `Metatype` (invoking the accessor
//! once) and relative tag-function enums to their resolved forms holding
//! absolute pointers. The rewrite is in place and idempotent: resolved
//! instructions occupy exactly the bytes of their unresolved forms, and
//! every other instruction is skipped at its on-wire width.

use skein_types::layout::{instruction_word, split_instruction_word, WORD};
use skein_types::RefKind;

use crate::interp::{GetEnumTagFn, MetadataAccessor};
use crate::metadata::TypeDesc;
use crate::reader::{read_relative_fn_at, LayoutCursor, LayoutWriter};

/// Walks `field_layout_str`'s instructions, rewriting into `layout_str` at
/// `layout_str_offset` (the byte offset of the field's first instruction
/// within the enclosing string).
///
/// # Safety
/// `layout_str` must be writable, `field_layout_str` must point at that
/// string's instruction region at `layout_str_offset`, and `field_type` must
/// carry the generic arguments the embedded accessors expect. The caller
/// serializes this pass against any concurrent driver.
#[no_mangle]
pub unsafe extern "C" fn sk_resolve_resilient_accessors(
    layout_str: *mut u8, layout_str_offset: usize, field_layout_str: *const u8,
    field_type: *const TypeDesc,
) {
    let field = &*field_type;
    let mut reader = LayoutCursor::new(field_layout_str, 0);

    loop {
        let instr_offset = reader.offset;
        let (kind_byte, gap) = split_instruction_word(reader.read::<u64>());
        let kind = RefKind::from_byte(kind_byte)
            .unwrap_or_else(|| panic!("unknown layout instruction kind {kind_byte:#04x}"));

        match kind {
            RefKind::End => return,

            RefKind::Resilient => {
                let accessor: MetadataAccessor = read_relative_fn_at(&mut reader);
                let ty = accessor(field.generic_args);
                let mut writer = LayoutWriter::new(layout_str, layout_str_offset + instr_offset);
                writer.write(instruction_word(RefKind::Metatype, gap));
                writer.write(ty);
            }

            RefKind::Metatype => reader.skip(WORD),

            RefKind::SinglePayloadEnumSimple => reader.skip(2 * 8 + 4 * WORD),

            RefKind::SinglePayloadEnumFn => {
                let get_enum_tag: GetEnumTagFn = read_relative_fn_at(&mut reader);
                let mut writer = LayoutWriter::new(layout_str, layout_str_offset + instr_offset);
                writer.write(instruction_word(RefKind::SinglePayloadEnumFnResolved, gap));
                writer.write(get_enum_tag as usize);
                reader.skip(2 * WORD);
            }

            RefKind::SinglePayloadEnumFnResolved => reader.skip(3 * WORD),

            RefKind::SinglePayloadEnumGeneric => {
                reader.skip(8 + WORD + WORD + 4);
                let ref_count_bytes = reader.read::<usize>();
                reader.skip(WORD + ref_count_bytes);
            }

            RefKind::MultiPayloadEnumFn => {
                let get_enum_tag: GetEnumTagFn = read_relative_fn_at(&mut reader);
                let mut writer = LayoutWriter::new(layout_str, layout_str_offset + instr_offset);
                writer.write(instruction_word(RefKind::MultiPayloadEnumFnResolved, gap));
                writer.write(get_enum_tag as usize);

                let num_cases = reader.read::<usize>();
                let ref_count_bytes = reader.read::<usize>();
                reader.skip(WORD); // enum size

                // Offsets of the sub-stream region in both coordinate spaces,
                // taken at the start of the payload-offset table.
                let cases_begin = layout_str_offset + reader.offset + num_cases * WORD;
                let field_cases_begin = reader.offset + num_cases * WORD;
                for _ in 0..num_cases {
                    let case_offset = reader.read::<usize>();
                    sk_resolve_resilient_accessors(
                        layout_str,
                        cases_begin + case_offset,
                        field_layout_str.add(field_cases_begin + case_offset),
                        field_type,
                    );
                }
                reader.skip(ref_count_bytes);
            }

            RefKind::MultiPayloadEnumFnResolved => {
                reader.skip(WORD);
                let num_cases = reader.read::<usize>();
                let ref_count_bytes = reader.read::<usize>();
                reader.skip(WORD + num_cases * WORD + ref_count_bytes);
            }

            RefKind::MultiPayloadEnumGeneric => {
                reader.skip(WORD);
                let num_payloads = reader.read::<usize>();
                let ref_count_bytes = reader.read::<usize>();
                reader.skip(WORD * (num_payloads + 1) + ref_count_bytes);
            }

            // Leaf kinds carry no operands.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::sk_generic_destroy;
    use crate::test_util::*;
    use skein_types::builder::LayoutBuilder;
    use skein_types::layout::LAYOUT_HEADER_BYTES;

    extern "C" fn first_generic_arg(args: *const *const TypeDesc) -> *const TypeDesc {
        unsafe { *args }
    }

    extern "C" fn tag_at_0(addr: *const u8) -> u32 {
        unsafe { *addr as u32 }
    }

    extern "C" fn tag_at_8(addr: *const u8) -> u32 {
        unsafe { *addr.add(8) as u32 }
    }

    fn strong_word_type() -> &'static TypeDesc {
        let mut b = LayoutBuilder::new();
        b.native_strong(0);
        b.end(0);
        leak_generic_type(8, 0, b.finish())
    }

    unsafe fn resolve_in_place(ptr: *mut u8, md: &TypeDesc) {
        sk_resolve_resilient_accessors(
            ptr,
            LAYOUT_HEADER_BYTES,
            (ptr as *const u8).add(LAYOUT_HEADER_BYTES),
            md,
        );
    }

    fn word_at(ptr: *const u8, off: usize) -> u64 {
        let mut tmp = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(off), tmp.as_mut_ptr(), 8) };
        u64::from_ne_bytes(tmp)
    }

    fn word_bytes(vals: &[usize]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn resilient_rewrites_to_metatype_with_same_effects() {
        let inner = strong_word_type();
        let mut b = LayoutBuilder::new();
        b.resilient(0, first_generic_arg as usize);
        b.end(0);
        let layout = b.finish();
        let len = layout.len();
        let ptr = leak_layout_mut(layout);
        let md = leak_generic_type_with_args(8, 0, ptr, vec![inner as *const TypeDesc]);

        let mut value = word_bytes(&[0x5000 | 0x1]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        let unresolved_log = take_log();
        assert_eq!(unresolved_log, vec![HostOp::StrongRelease(0x5000)]);

        unsafe { resolve_in_place(ptr, md) };

        let word = word_at(ptr, LAYOUT_HEADER_BYTES);
        let (kind, gap) = skein_types::layout::split_instruction_word(word);
        assert_eq!(kind, RefKind::Metatype as u8);
        assert_eq!(gap, 0);
        assert_eq!(
            word_at(ptr, LAYOUT_HEADER_BYTES + 8),
            inner as *const TypeDesc as usize as u64
        );

        let mut value = word_bytes(&[0x5000 | 0x1]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        assert_eq!(take_log(), unresolved_log);

        let snapshot = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec();
        unsafe { resolve_in_place(ptr, md) };
        let again = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
        assert_eq!(again, &snapshot[..]);
    }

    #[test]
    fn single_payload_fn_resolves_to_absolute_pointer() {
        let mut b = LayoutBuilder::new();
        b.single_payload_enum_fn(0, tag_at_0 as usize, 16, |b| b.native_strong(8));
        b.end(0);
        let layout = b.finish();
        let len = layout.len();
        let ptr = leak_layout_mut(layout);
        let md = leak_generic_type_raw(16, 0, ptr);

        let mut value = word_bytes(&[0, 0xb000]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        assert_eq!(take_log(), vec![HostOp::StrongRelease(0xb000)]);

        unsafe { resolve_in_place(ptr, md) };

        let (kind, _) =
            skein_types::layout::split_instruction_word(word_at(ptr, LAYOUT_HEADER_BYTES));
        assert_eq!(kind, RefKind::SinglePayloadEnumFnResolved as u8);
        assert_eq!(
            word_at(ptr, LAYOUT_HEADER_BYTES + 8),
            tag_at_0 as usize as u64
        );

        let mut value = word_bytes(&[0, 0xb000]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        assert_eq!(take_log(), vec![HostOp::StrongRelease(0xb000)]);

        let mut value = word_bytes(&[5, 0xb000]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        assert_eq!(take_log(), vec![]);

        let snapshot = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec();
        unsafe { resolve_in_place(ptr, md) };
        let again = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
        assert_eq!(again, &snapshot[..]);
    }

    #[test]
    fn multi_payload_fn_resolution_recurses_into_payload_streams() {
        let inner = strong_word_type();
        let mut b = LayoutBuilder::new();
        b.multi_payload_enum_fn(
            0,
            tag_at_8 as usize,
            16,
            &[
                &|b: &mut LayoutBuilder| {
                    b.resilient(0, first_generic_arg as usize);
                    b.end(0);
                },
                &|b: &mut LayoutBuilder| {
                    b.native_strong(0);
                    b.end(0);
                },
            ],
        );
        b.end(0);
        let layout = b.finish();
        let len = layout.len();
        let ptr = leak_layout_mut(layout);
        let md = leak_generic_type_with_args(16, 0, ptr, vec![inner as *const TypeDesc]);

        unsafe { resolve_in_place(ptr, md) };

        let (kind, _) =
            skein_types::layout::split_instruction_word(word_at(ptr, LAYOUT_HEADER_BYTES));
        assert_eq!(kind, RefKind::MultiPayloadEnumFnResolved as u8);
        assert_eq!(
            word_at(ptr, LAYOUT_HEADER_BYTES + 8),
            tag_at_8 as usize as u64
        );

        // Payload sub-streams start after the five operand words and the
        // two-entry offset table; payload 0's resilient instruction is now a
        // metatype reference.
        let streams = LAYOUT_HEADER_BYTES + 5 * 8 + 2 * 8;
        let (kind, _) = skein_types::layout::split_instruction_word(word_at(ptr, streams));
        assert_eq!(kind, RefKind::Metatype as u8);
        assert_eq!(
            word_at(ptr, streams + 8),
            inner as *const TypeDesc as usize as u64
        );

        let mut value = word_bytes(&[0x5000, 0]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        assert_eq!(take_log(), vec![HostOp::StrongRelease(0x5000)]);

        let mut value = word_bytes(&[0x6000, 1]);
        reset_log();
        unsafe { sk_generic_destroy(value.as_mut_ptr(), md) };
        assert_eq!(take_log(), vec![HostOp::StrongRelease(0x6000)]);

        let snapshot = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec();
        unsafe { resolve_in_place(ptr, md) };
        let again = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
        assert_eq!(again, &snapshot[..]);
    }
}
