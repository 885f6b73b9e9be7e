// Turn / Block data model and typed key registry

pub mod block;
pub mod keys;
pub mod turn;

pub use block::{payload, role, Block, BlockKind};
pub use keys::{
    BlockMetaKey, BlockMetadata, Data, DataKey, Key, KeyMap, TurnMetaKey, TurnMetadata,
};
pub use turn::Turn;
