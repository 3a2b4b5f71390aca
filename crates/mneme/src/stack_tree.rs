//! Interning of whole frame chains into dense [`StackId`]s.
//!
//! Stacks are a trie: node = (parent chain, one frame). Ids are assigned in
//! first-visit order, which for a record stream means *stream order*. The
//! writer (for aggregated captures) and the reader both replay the same
//! `FRAME_PUSH`/`FRAME_POP` sequence through this structure, so the ids they
//! assign agree without ever being written to the wire.

use ahash::AHashMap;

use crate::records::{ShadowFrame, StackId};

#[derive(Debug, Default)]
pub(crate) struct StackTree {
    children: AHashMap<(StackId, ShadowFrame), StackId>,
    /// Parent and frame of each issued id; index is `id - 1`.
    nodes: Vec<(StackId, ShadowFrame)>,
}

impl StackTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of `parent` extended by `frame`, interning on first visit.
    pub fn child(&mut self, parent: StackId, frame: ShadowFrame) -> StackId {
        if let Some(&id) = self.children.get(&(parent, frame)) {
            return id;
        }
        let id = StackId::from_raw(u32::try_from(self.nodes.len() + 1).unwrap_or(u32::MAX));
        self.children.insert((parent, frame), id);
        self.nodes.push((parent, frame));
        id
    }

    /// The chain one frame shorter than `id`, or `None` for the empty stack.
    pub fn parent(&self, id: StackId) -> Option<StackId> {
        if id == StackId::EMPTY {
            return None;
        }
        self.nodes.get(id.raw() as usize - 1).map(|&(parent, _)| parent)
    }

    /// All frames of the chain, outermost first.
    pub fn frames(&self, id: StackId) -> Vec<ShadowFrame> {
        let mut frames = Vec::new();
        let mut cursor = id;
        while cursor != StackId::EMPTY {
            let Some(&(parent, frame)) = self.nodes.get(cursor.raw() as usize - 1) else {
                break;
            };
            frames.push(frame);
            cursor = parent;
        }
        frames.reverse();
        frames
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::CodeId;

    fn frame(code: u32) -> ShadowFrame {
        ShadowFrame::at_entry(CodeId::from_raw(code), false)
    }

    #[test]
    fn shared_prefixes_share_nodes() {
        let mut tree = StackTree::new();
        let a = tree.child(StackId::EMPTY, frame(1));
        let ab = tree.child(a, frame(2));
        let a_again = tree.child(StackId::EMPTY, frame(1));
        let ab_again = tree.child(a_again, frame(2));
        assert_eq!(ab, ab_again);
        assert_eq!(tree.len(), 2);

        let ac = tree.child(a, frame(3));
        assert_ne!(ab, ac);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn frames_come_out_outermost_first() {
        let mut tree = StackTree::new();
        let a = tree.child(StackId::EMPTY, frame(1));
        let ab = tree.child(a, frame(2));
        let abc = tree.child(ab, frame(3));
        let frames: Vec<u32> = tree.frames(abc).into_iter().map(|f| f.code.raw()).collect();
        assert_eq!(frames, vec![1, 2, 3]);
        assert_eq!(tree.parent(abc), Some(ab));
        assert_eq!(tree.parent(StackId::EMPTY), None);
    }
}
