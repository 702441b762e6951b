use num_derive::FromPrimitive;

/// Instruction kinds for layout strings. The value is the byte stored in the
/// top 8 bits of each tagged instruction word, and doubles as the dispatch
/// table index in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum RefKind {
    End = 0x00,
    Error = 0x01,
    NativeStrong = 0x02,
    Unowned = 0x03,
    Weak = 0x04,
    Unknown = 0x05,
    UnknownUnowned = 0x06,
    UnknownWeak = 0x07,
    Bridge = 0x08,
    Block = 0x09,
    ObjcStrong = 0x0a,
    // Reserved; never emitted.
    Custom = 0x0b,
    Metatype = 0x0c,
    // Reserved; never emitted.
    Generic = 0x0d,
    Existential = 0x0e,
    Resilient = 0x0f,
    SinglePayloadEnumSimple = 0x10,
    SinglePayloadEnumFn = 0x11,
    SinglePayloadEnumFnResolved = 0x12,
    SinglePayloadEnumGeneric = 0x13,
    MultiPayloadEnumFn = 0x14,
    MultiPayloadEnumFnResolved = 0x15,
    MultiPayloadEnumGeneric = 0x16,
}

/// Number of dispatch table slots (End through MultiPayloadEnumGeneric).
pub const NUM_KINDS: usize = 0x17;

impl RefKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        num_traits::FromPrimitive::from_u8(b)
    }
}
