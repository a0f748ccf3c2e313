//! 标记阶段
//!
//! 从每个效应器出发向根方向走，给经过的节点打标记：
//! - 走到链长上限或根节点时标记为 `Base`
//! - 其余节点标记为 `Section`
//!
//! `Section` 总是覆盖 `Base`：被任意一条链当作中间节点经过的祖先，
//! 绝不能成为另一条链的终点。

use std::collections::HashMap;

use crate::tree::{Guid, NodeId, NodeTree};
use crate::Result;

/// 节点标记
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mark {
    /// 链的中间节点（包括效应器本身）
    Section,
    /// 独立岛的根
    Base,
}

pub type Marks = HashMap<Guid, Mark>;

/// 收集挂有效应器的节点（前序）
pub fn effector_nodes(tree: &NodeTree) -> Result<Vec<NodeId>> {
    let mut nodes = Vec::new();
    for id in tree.pre_order() {
        if tree.with_data(id, |data| data.effector.is_some())? {
            nodes.try_reserve(1)?;
            nodes.push(id);
        }
    }
    Ok(nodes)
}

/// 给所有参与求解的节点打标记
pub fn mark_nodes(tree: &NodeTree, effectors: &[NodeId]) -> Result<Marks> {
    let mut marks = Marks::new();

    for &effector in effectors {
        let chain_length = tree.with_data(effector, |data| {
            data.effector.as_ref().map_or(0, |e| e.chain_length)
        })?;

        let mut node = Some(effector);
        let mut steps: u32 = 0;
        while let Some(id) = node {
            let parent = tree.parent(id);
            let is_base = parent.is_none() || (chain_length != 0 && steps == u32::from(chain_length));
            let new_mark = if is_base { Mark::Base } else { Mark::Section };

            let Some(guid) = tree.guid(id) else { break };
            match marks.get_mut(&guid) {
                Some(current) => {
                    if new_mark == Mark::Section {
                        *current = Mark::Section;
                    }
                }
                None => {
                    marks.try_reserve(1)?;
                    marks.insert(guid, new_mark);
                }
            }

            if is_base {
                break;
            }
            node = parent;
            steps += 1;
        }
    }

    Ok(marks)
}
