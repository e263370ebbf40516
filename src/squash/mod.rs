pub mod message;
pub mod patterns;
pub mod squasher;
pub mod timestamp;

pub use message::Message;
pub use patterns::{GroupJoiner, GroupMatch, MultilineGroupJoiner, PatternError};
pub use squasher::{IndexedString, MultilineGroupMatch, MultilineState, Squasher};
