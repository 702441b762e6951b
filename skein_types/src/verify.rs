//! Structural verification of layout strings.
//!
//! The runtime interpreter trusts its input and aborts on malformed streams;
//! this walk is for the emitting compiler and for debug harnesses that want a
//! recoverable answer instead. It checks kind bytes, operand lengths, End
//! termination, and the sub-stream bookkeeping of enum instructions.

use byteorder::{ByteOrder, NativeEndian};
use thiserror::Error;

use crate::layout::{split_instruction_word, LAYOUT_HEADER_BYTES, WORD};
use crate::RefKind;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("layout string shorter than its fixed header")]
    TruncatedHeader,
    #[error("unexpectedly hit end of layout string while reading {0} bytes")]
    UnexpectedEof(usize),
    #[error("unknown instruction kind {kind:#04x} at offset {offset}")]
    UnknownKind { kind: u8, offset: usize },
    #[error("reserved instruction kind {kind:?} at offset {offset}")]
    ReservedKind { kind: RefKind, offset: usize },
    #[error("tag byte-count pattern {0} exceeds a 64-bit tag")]
    BadTagPattern(u8),
    #[error("enum sub-stream at offset {offset} does not end on an instruction boundary")]
    SubStreamMisaligned { offset: usize },
    #[error("end terminator inside an inline enum sub-stream at offset {offset}")]
    EndInSubStream { offset: usize },
    #[error("payload {index} sub-stream offset {payload_offset} outside {sub_stream_bytes}-byte region")]
    PayloadOutOfRange { index: usize, payload_offset: usize, sub_stream_bytes: usize },
}

/// What a successful walk saw. `stream_bytes` covers everything between the
/// header and the final End inclusive, nested sub-streams included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSummary {
    pub instructions: usize,
    pub stream_bytes: usize,
}

pub fn verify_layout(bytes: &[u8]) -> Result<LayoutSummary, VerifyError> {
    if bytes.len() < LAYOUT_HEADER_BYTES {
        return Err(VerifyError::TruncatedHeader);
    }
    let mut walk = Walk {
        bytes,
        pos: LAYOUT_HEADER_BYTES,
        instructions: 0,
    };
    walk.stream()?;
    Ok(LayoutSummary {
        instructions: walk.instructions,
        stream_bytes: walk.pos - LAYOUT_HEADER_BYTES,
    })
}

struct Walk<'a> {
    bytes: &'a [u8],
    pos: usize,
    instructions: usize,
}

impl Walk<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], VerifyError> {
        let end = self.pos.checked_add(n).ok_or(VerifyError::UnexpectedEof(n))?;
        if end > self.bytes.len() {
            return Err(VerifyError::UnexpectedEof(n));
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn word(&mut self) -> Result<u64, VerifyError> {
        Ok(NativeEndian::read_u64(self.take(8)?))
    }

    fn size_word(&mut self) -> Result<usize, VerifyError> {
        Ok(NativeEndian::read_uint(self.take(WORD)?, WORD) as usize)
    }

    fn tag_pattern(&mut self, pattern: u8) -> Result<(), VerifyError> {
        // Patterns address 1 << (pattern - 1) bytes; anything over 8 bytes
        // cannot be read by the runtime's tag loader.
        if pattern > 4 {
            return Err(VerifyError::BadTagPattern(pattern));
        }
        Ok(())
    }

    /// Walks instructions until End. Inline single-payload sub-streams are
    /// tracked as checkpoints the walk must land on exactly.
    fn stream(&mut self) -> Result<(), VerifyError> {
        let mut checkpoints: Vec<usize> = Vec::new();
        loop {
            while let Some(&cp) = checkpoints.last() {
                if self.pos < cp {
                    break;
                }
                if self.pos > cp {
                    return Err(VerifyError::SubStreamMisaligned { offset: cp });
                }
                checkpoints.pop();
            }

            let offset = self.pos;
            let (kind_byte, _gap) = split_instruction_word(self.word()?);
            let kind = RefKind::from_byte(kind_byte)
                .ok_or(VerifyError::UnknownKind { kind: kind_byte, offset })?;
            self.instructions += 1;

            match kind {
                RefKind::End => {
                    if let Some(&cp) = checkpoints.last() {
                        return Err(VerifyError::EndInSubStream { offset: cp });
                    }
                    return Ok(());
                }
                RefKind::Error
                | RefKind::NativeStrong
                | RefKind::Unowned
                | RefKind::Weak
                | RefKind::Unknown
                | RefKind::UnknownUnowned
                | RefKind::UnknownWeak
                | RefKind::Bridge
                | RefKind::Block
                | RefKind::ObjcStrong
                | RefKind::Existential => {}
                RefKind::Custom | RefKind::Generic => {
                    return Err(VerifyError::ReservedKind { kind, offset });
                }
                RefKind::Metatype => {
                    self.take(WORD)?;
                }
                RefKind::Resilient => {
                    self.take(8)?;
                }
                RefKind::SinglePayloadEnumSimple => {
                    let byte_counts = self.word()?;
                    self.tag_pattern(crate::layout::extra_tag_pattern(byte_counts))?;
                    self.tag_pattern(crate::layout::xi_tag_pattern(byte_counts))?;
                    self.size_word()?; // payload size
                    self.word()?; // zero tag value
                    self.size_word()?; // XI tag values
                    let sub = self.size_word()?;
                    self.size_word()?; // skip
                    checkpoints.push(self.pos + sub);
                }
                RefKind::SinglePayloadEnumFn | RefKind::SinglePayloadEnumFnResolved => {
                    self.take(8)?; // tag function slot
                    let sub = self.size_word()?;
                    self.size_word()?; // skip
                    checkpoints.push(self.pos + sub);
                }
                RefKind::SinglePayloadEnumGeneric => {
                    let byte_counts = self.word()?;
                    self.tag_pattern(crate::layout::extra_tag_pattern(byte_counts))?;
                    self.size_word()?; // payload size
                    self.take(WORD)?; // XI type descriptor
                    self.take(4)?; // empty-case count
                    let sub = self.size_word()?;
                    self.size_word()?; // skip
                    checkpoints.push(self.pos + sub);
                }
                RefKind::MultiPayloadEnumFn
                | RefKind::MultiPayloadEnumFnResolved
                | RefKind::MultiPayloadEnumGeneric => {
                    if kind == RefKind::MultiPayloadEnumGeneric {
                        let tag_bytes = self.size_word()?;
                        if !matches!(tag_bytes, 1 | 2 | 4 | 8) {
                            return Err(VerifyError::BadTagPattern(tag_bytes as u8));
                        }
                    } else {
                        self.take(8)?; // tag function slot
                    }
                    let num_payloads = self.size_word()?;
                    let sub_bytes = self.size_word()?;
                    self.size_word()?; // enum size
                    let mut offsets = Vec::with_capacity(num_payloads);
                    for _ in 0..num_payloads {
                        offsets.push(self.size_word()?);
                    }
                    let streams_start = self.pos;
                    self.take(sub_bytes)?;
                    let streams_end = streams_start + sub_bytes;
                    let bytes = self.bytes;
                    for (index, payload_offset) in offsets.into_iter().enumerate() {
                        let start = streams_start.checked_add(payload_offset);
                        match start {
                            Some(start) if start < streams_end => {
                                let mut nested = Walk {
                                    bytes: &bytes[..streams_end],
                                    pos: start,
                                    instructions: 0,
                                };
                                nested.stream()?;
                                self.instructions += nested.instructions;
                            }
                            _ => {
                                return Err(VerifyError::PayloadOutOfRange {
                                    index,
                                    payload_offset,
                                    sub_stream_bytes: sub_bytes,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}
