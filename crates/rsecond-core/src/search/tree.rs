//! 探索ノードのアリーナ。親へはインデックスで戻る。

use crate::position::Position;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Debug)]
pub struct SearchNode {
    pub position: Position,
    pub parent: Option<NodeId>,
    /// 親からこのノードへ至った手 (UCI)。根は `None`。
    pub mv: Option<String>,
    /// 根からの手数
    pub ply: u32,
    /// 親局面でこの手が指された対局数
    pub prior_count: u64,
}

#[derive(Debug)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
}

impl SearchTree {
    pub fn new(root: Position) -> Self {
        Self {
            nodes: vec![SearchNode {
                position: root,
                parent: None,
                mv: None,
                ply: 0,
                prior_count: 0,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &SearchNode {
        &self.nodes[id.0]
    }

    pub fn push_child(
        &mut self,
        parent: NodeId,
        mv: String,
        position: Position,
        prior_count: u64,
    ) -> NodeId {
        let ply = self.get(parent).ply + 1;
        self.nodes.push(SearchNode {
            position,
            parent: Some(parent),
            mv: Some(mv),
            ply,
            prior_count,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// 根からの手順 (UCI)
    pub fn path(&self, id: NodeId) -> Vec<String> {
        let mut moves = Vec::with_capacity(self.get(id).ply as usize);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.get(current);
            if let Some(mv) = &node.mv {
                moves.push(mv.clone());
            }
            cursor = node.parent;
        }
        moves.reverse();
        moves
    }

    pub fn path_string(&self, id: NodeId) -> String {
        self.path(id).join(" ")
    }
}
