// Turn - one request/response cycle
//
// Blocks are append-only during a run and keep their order for the Turn's
// lifetime. Metadata describes the run (ids, usage, model); Data carries
// request-scoped parameters (tool config, allowed tools). `Clone` is a deep
// copy, safe to hand to middleware that wants to keep a snapshot.

use serde::{Deserialize, Serialize};

use super::block::{Block, BlockKind};
use super::keys::{self, Data, TurnMetadata};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,

    #[serde(default)]
    pub blocks: Vec<Block>,

    #[serde(default, skip_serializing_if = "TurnMetadata::is_empty")]
    pub metadata: TurnMetadata,

    #[serde(default, skip_serializing_if = "Data::is_empty")]
    pub data: Data,
}

impl Turn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn seeded with the given blocks
    pub fn with_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
        Self {
            blocks: blocks.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn append_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn append_blocks(&mut self, blocks: impl IntoIterator<Item = Block>) {
        self.blocks.extend(blocks);
    }

    /// Insert at the front; used for system prompts only
    pub fn prepend_block(&mut self, block: Block) {
        self.blocks.insert(0, block);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks_of_kind(&self, kind: BlockKind) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(move |b| b.kind == kind)
    }

    pub fn last_block_of_kind(&self, kind: BlockKind) -> Option<&Block> {
        self.blocks.iter().rev().find(|b| b.kind == kind)
    }

    /// Text of the most recent `llm_text` block
    pub fn last_llm_text(&self) -> Option<&str> {
        self.last_block_of_kind(BlockKind::LlmText)
            .and_then(Block::text)
    }

    /// Count blocks per kind, in first-seen order
    pub fn kind_counts(&self) -> Vec<(BlockKind, usize)> {
        let mut counts: Vec<(BlockKind, usize)> = Vec::new();
        for block in &self.blocks {
            match counts.iter_mut().find(|(k, _)| *k == block.kind) {
                Some((_, n)) => *n += 1,
                None => counts.push((block.kind, 1)),
            }
        }
        counts
    }

    /// Session id stamped in metadata, if any. Decode errors read as absent.
    pub fn session_id(&self) -> Option<String> {
        keys::SESSION_ID.get(&self.metadata).ok().flatten()
    }

    pub fn inference_id(&self) -> Option<String> {
        keys::INFERENCE_ID.get(&self.metadata).ok().flatten()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }
}
