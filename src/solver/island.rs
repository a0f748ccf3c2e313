//! 岛 - 扁平化的独立求解区域
//!
//! 每个标记为 `Base` 的节点是一个岛的根，岛包含根节点以及
//! 沿 `Section` 子节点能到达的所有后代。
//!
//! 构建分两步：
//! - 规划：只读遍历节点树，确定每个岛包含哪些节点
//! - 扁平化：先为所有岛分配好缓冲区和索引表，全部成功后才把节点改为指向新缓冲区
//!
//! 第二步保证了内存分配失败时节点树和旧的岛都不会被改动。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use super::marking::{Mark, Marks};
use super::pose::{filled, Pose};
use super::{bone, fabrik, IslandResult, NodeView};
use crate::config::{Algorithm, SolverConfig};
use crate::tree::{Guid, NodeData, NodeDataRef, NodeId, NodeTree, SharedNodeData, Transform};
use crate::{IkError, Result};

// ============================================================================
// 索引表
// ============================================================================

/// 遍历索引
///
/// 第 i 项同时描述前序第 i 步和后序第 i 步访问的节点。
/// `*_base` 是该节点最近的链边界祖先（岛根、分支点或效应器）所在的槽位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexData {
    pub pre_node: usize,
    pub pre_base: usize,
    pub pre_child_count: usize,
    pub post_node: usize,
    pub post_base: usize,
    pub post_child_count: usize,
}

/// 链视图：从末端到链底的节点 guid，子链以本链的末端作为链底
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub nodes: Vec<Guid>,
    pub children: Vec<Chain>,
}

impl Chain {
    #[inline]
    pub fn tip(&self) -> Option<Guid> {
        self.nodes.first().copied()
    }

    #[inline]
    pub fn base(&self) -> Option<Guid> {
        self.nodes.last().copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ============================================================================
// 岛
// ============================================================================

/// 扁平化的岛
///
/// 节点数据按前序存放在共享缓冲区中，槽位 0 是岛根。
/// 缓冲区的持有者是岛本身以及岛内每个节点。
#[derive(Debug)]
pub struct Island {
    buffer: SharedNodeData,
    node_ids: Vec<NodeId>,
    guids: Vec<Guid>,
    parent_idx: Vec<usize>,
    indices: Vec<IndexData>,
    boundary: Vec<bool>,
    /// 岛根的父节点，求解时作为锚点
    anchor: Option<NodeId>,
    pose: Pose,
}

impl Island {
    #[inline]
    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// 前序排列的节点 guid
    #[inline]
    pub fn guids(&self) -> &[Guid] {
        &self.guids
    }

    #[inline]
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    #[inline]
    pub fn base_guid(&self) -> Guid {
        self.guids[0]
    }

    #[inline]
    pub fn base_node(&self) -> NodeId {
        self.node_ids[0]
    }

    /// 每个槽位的父槽位（岛根指向自己）
    #[inline]
    pub fn parent_indices(&self) -> &[usize] {
        &self.parent_idx
    }

    #[inline]
    pub fn indices(&self) -> &[IndexData] {
        &self.indices
    }

    /// 共享缓冲区的持有者数量
    #[inline]
    pub fn buffer_refcount(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    /// 岛内的链分解
    pub fn chains(&self) -> Vec<Chain> {
        let tips: Vec<usize> = (1..self.len()).filter(|&slot| self.boundary[slot]).collect();
        let mut chains: Vec<Option<Chain>> = tips
            .iter()
            .map(|&tip| Some(self.chain_from(tip)))
            .collect();

        // 子链的末端槽位总是大于父链，倒序处理保证挂到父链时子链已经完整
        let mut roots = Vec::new();
        for k in (0..tips.len()).rev() {
            let Some(chain) = chains[k].take() else { continue };
            let base = self.indices[tips[k]].pre_base;
            match tips.binary_search(&base) {
                Ok(parent) => {
                    if let Some(parent_chain) = chains[parent].as_mut() {
                        parent_chain.children.insert(0, chain);
                    }
                }
                Err(_) => roots.insert(0, chain),
            }
        }
        roots
    }

    fn chain_from(&self, tip: usize) -> Chain {
        let base = self.indices[tip].pre_base;
        let mut nodes = vec![self.guids[tip]];
        let mut slot = tip;
        while slot != base {
            slot = self.parent_idx[slot];
            nodes.push(self.guids[slot]);
        }
        Chain {
            nodes,
            children: Vec::new(),
        }
    }

    /// 求解并把结果写回共享缓冲区（也就是节点树本身的数据）
    pub(crate) fn solve(&mut self, tree: &NodeTree, config: &SolverConfig) -> Result<IslandResult> {
        let anchor = match self.anchor {
            Some(parent) => tree.global_transform(parent)?,
            None => Transform::IDENTITY,
        };

        let mut guard = self.buffer.write().unwrap_or_else(|e| e.into_inner());
        let nodes = guard.as_mut_slice();
        let result = match config.algorithm {
            Algorithm::Fabrik => fabrik::solve(
                nodes,
                &self.parent_idx,
                &self.indices,
                anchor,
                config,
                &mut self.pose,
            ),
            Algorithm::OneBone => {
                bone::solve_one_bone(nodes, &self.parent_idx, anchor, config, &mut self.pose)
            }
            Algorithm::TwoBone => {
                bone::solve_two_bone(nodes, &self.parent_idx, anchor, config, &mut self.pose)
            }
        };
        Ok(result)
    }

    /// 依次访问给定槽位的节点
    pub(crate) fn visit(&self, slots: std::ops::Range<usize>, f: &mut impl FnMut(NodeView)) {
        let guard = self.buffer.read().unwrap_or_else(|e| e.into_inner());
        for slot in slots {
            let (Some(data), Some(&id)) = (guard.get(slot), self.node_ids.get(slot)) else {
                continue;
            };
            f(NodeView::new(id, self.guids[slot], data));
        }
    }
}

// ============================================================================
// 构建
// ============================================================================

/// 一个岛的节点（尚未改动节点树）
#[derive(Debug)]
struct IslandPlan {
    /// 前序，子节点按 guid 升序
    nodes: Vec<NodeId>,
    parent_idx: Vec<usize>,
}

/// 从标记结果构建所有岛，返回的顺序满足依赖关系
pub(crate) fn build_islands(
    tree: &mut NodeTree,
    marks: &Marks,
    algorithm: Algorithm,
) -> Result<Vec<Island>> {
    let plans = plan_islands(tree, marks)?;
    for plan in &plans {
        check_topology(tree, plan, algorithm)?;
    }
    flatten(tree, plans)
}

fn mark_of(tree: &NodeTree, marks: &Marks, id: NodeId) -> Option<Mark> {
    tree.guid(id).and_then(|guid| marks.get(&guid).copied())
}

/// 遍历整棵树找出所有岛根
///
/// 子节点的访问顺序：`Section` 优先，其次 `Base`，最后未标记。
/// 依赖其他岛的岛总是在被依赖的岛之后被发现。
fn plan_islands(tree: &NodeTree, marks: &Marks) -> Result<Vec<IslandPlan>> {
    let mut plans = Vec::new();
    let mut stack = vec![tree.root()];

    while let Some(id) = stack.pop() {
        if mark_of(tree, marks, id) == Some(Mark::Base) {
            let plan = collect_island(tree, marks, id)?;
            // 少于两个节点的岛（例如根节点上的效应器）没有骨骼可解
            if plan.nodes.len() >= 2 {
                plans.try_reserve(1)?;
                plans.push(plan);
            }
        }

        // 入栈顺序与访问顺序相反
        let children = tree.children(id);
        for wanted in [None, Some(Mark::Base), Some(Mark::Section)] {
            for &child in children.iter().rev() {
                if mark_of(tree, marks, child) == wanted {
                    stack.try_reserve(1)?;
                    stack.push(child);
                }
            }
        }
    }

    Ok(plans)
}

/// 从岛根出发，沿 `Section` 子节点前序收集
fn collect_island(tree: &NodeTree, marks: &Marks, base: NodeId) -> Result<IslandPlan> {
    let mut nodes = Vec::new();
    let mut parent_idx = Vec::new();
    let mut stack = vec![(base, 0)];

    while let Some((id, parent_slot)) = stack.pop() {
        let slot = nodes.len();
        nodes.try_reserve(1)?;
        parent_idx.try_reserve(1)?;
        nodes.push(id);
        parent_idx.push(parent_slot);

        for &child in tree.children(id).iter().rev() {
            if mark_of(tree, marks, child) == Some(Mark::Section) {
                stack.try_reserve(1)?;
                stack.push((child, slot));
            }
        }
    }

    Ok(IslandPlan { nodes, parent_idx })
}

/// 解析解只支持无分支、末端带效应器的固定长度链
fn check_topology(tree: &NodeTree, plan: &IslandPlan, algorithm: Algorithm) -> Result<()> {
    let expected = match algorithm {
        Algorithm::Fabrik => return Ok(()),
        Algorithm::OneBone => 2,
        Algorithm::TwoBone => 3,
    };

    let len = plan.nodes.len();
    let unbranched = plan
        .parent_idx
        .iter()
        .enumerate()
        .skip(1)
        .all(|(slot, &parent)| parent + 1 == slot);
    if len != expected || !unbranched {
        let base = tree.guid(plan.nodes[0]).unwrap_or_default();
        return Err(IkError::UnsupportedTopology {
            algorithm,
            reason: format!("以 {base} 为根的岛有 {len} 个节点，需要 {expected} 个节点的无分支链"),
        });
    }

    let tip = plan.nodes[len - 1];
    if !tree.with_data(tip, |data| data.effector.is_some())? {
        let guid = tree.guid(tip).unwrap_or_default();
        return Err(IkError::UnsupportedTopology {
            algorithm,
            reason: format!("链末端 {guid} 没有效应器"),
        });
    }

    // 解析解只追踪末端目标，中间节点上的效应器永远无法满足
    for &id in &plan.nodes[1..len - 1] {
        if tree.with_data(id, |data| data.effector.is_some())? {
            let guid = tree.guid(id).unwrap_or_default();
            return Err(IkError::UnsupportedTopology {
                algorithm,
                reason: format!("中间节点 {guid} 上的效应器不被支持"),
            });
        }
    }
    Ok(())
}

/// 计算索引表和链边界
fn compute_indices(tree: &NodeTree, plan: &IslandPlan) -> Result<(Vec<IndexData>, Vec<bool>)> {
    let n = plan.nodes.len();
    let parent = &plan.parent_idx;

    let mut child_count = filled(n, 0usize)?;
    let mut depth = filled(n, 0usize)?;
    let mut size = filled(n, 1usize)?;
    for i in 1..n {
        child_count[parent[i]] += 1;
        depth[i] = depth[parent[i]] + 1;
    }
    for i in (1..n).rev() {
        size[parent[i]] += size[i];
    }

    // 链边界：岛根、分支点、效应器
    let mut boundary = filled(n, false)?;
    for (slot, &id) in plan.nodes.iter().enumerate() {
        let has_effector = tree.with_data(id, |data| data.effector.is_some())?;
        boundary[slot] = slot == 0 || child_count[slot] >= 2 || has_effector;
    }

    let mut base_of = filled(n, 0usize)?;
    for i in 1..n {
        let p = parent[i];
        base_of[i] = if boundary[p] { p } else { base_of[p] };
    }

    // 节点在前序中占据 [i, i + size)，后序位置 = 前面不是祖先的节点数 + 子树中的后代数
    let mut indices = filled(n, IndexData::default())?;
    for i in 0..n {
        indices[i].pre_node = i;
        indices[i].pre_base = base_of[i];
        indices[i].pre_child_count = child_count[i];

        let post = i - depth[i] + size[i] - 1;
        indices[post].post_node = i;
        indices[post].post_base = base_of[i];
        indices[post].post_child_count = child_count[i];
    }

    Ok((indices, boundary))
}

/// 为每个岛分配缓冲区并拷贝节点数据，全部成功后再改写节点树
fn flatten(tree: &mut NodeTree, plans: Vec<IslandPlan>) -> Result<Vec<Island>> {
    let mut islands = Vec::new();
    islands.try_reserve_exact(plans.len())?;

    for plan in plans {
        let n = plan.nodes.len();
        let mut data: Vec<NodeData> = Vec::new();
        let mut guids = Vec::new();
        data.try_reserve_exact(n)?;
        guids.try_reserve_exact(n)?;
        for &id in &plan.nodes {
            data.push(tree.data_ref(id)?.read(NodeData::clone));
            guids.push(tree.guid(id).ok_or(IkError::NodeNotFound(id))?);
        }

        let (indices, boundary) = compute_indices(tree, &plan)?;
        let pose = Pose::with_len(n)?;
        let anchor = tree.parent(plan.nodes[0]);

        islands.push(Island {
            buffer: Arc::new(RwLock::new(data)),
            node_ids: plan.nodes,
            guids,
            parent_idx: plan.parent_idx,
            indices,
            boundary,
            anchor,
            pose,
        });
    }

    // 不再属于任何岛的节点换回私有缓冲区，旧岛的缓冲区才能被释放
    let mut in_island = HashSet::new();
    in_island.try_reserve(islands.iter().map(Island::len).sum())?;
    for island in &islands {
        in_island.extend(island.node_ids.iter().copied());
    }
    let mut released = Vec::new();
    for id in tree.pre_order() {
        if in_island.contains(&id) {
            continue;
        }
        let data_ref = tree.data_ref(id)?;
        if data_ref.is_shared() {
            released.try_reserve(1)?;
            released.push((id, NodeDataRef::private(data_ref.read(NodeData::clone))));
        }
    }

    // 节点释放私有（或旧岛的）缓冲区引用，改为持有新缓冲区
    for island in &islands {
        for (slot, &id) in island.node_ids.iter().enumerate() {
            tree.repoint(id, NodeDataRef::shared(&island.buffer, slot))?;
        }
    }
    for (id, data_ref) in released {
        tree.repoint(id, data_ref)?;
    }

    Ok(islands)
}
