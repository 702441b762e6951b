pub mod builder;
pub mod flags;
pub mod kind;
pub mod layout;
pub mod verify;

pub use builder::{LayoutBuilder, LayoutString};
pub use flags::WitnessFlags;
pub use kind::RefKind;
