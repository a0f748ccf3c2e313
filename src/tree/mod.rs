//! 节点树 - 可变的关节层级
//!
//! 核心设计思想：
//! - 节点存放在 arena 中，通过 `NodeId` 访问
//! - 每个节点有全树唯一的 guid，子节点按 guid 排序
//! - 节点数据放在引用计数的共享缓冲区里（见 `node_data`）
//! - 任何影响岛划分的修改都会推进 `revision`，求解器据此发现过期的岛

mod attachment;
mod node_data;

#[cfg(test)]
pub(crate) mod fixtures;

pub use attachment::{
    AttachmentKind, Constraint, ConstraintFn, ConstraintKind, Effector, EffectorFlags, Pole,
    UserData,
};
pub use node_data::{NodeData, SharedNodeData};
pub(crate) use node_data::NodeDataRef;

use std::collections::HashMap;

use glam::{Quat, Vec3};

use crate::{IkError, Result};

/// 节点的稳定标识
pub type Guid = u32;

/// 节点在 arena 中的索引
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

// ============================================================================
// 变换
// ============================================================================

/// 刚体变换（不含缩放）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    #[inline]
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    /// 父变换 * 子节点本地变换
    #[inline]
    pub fn then(&self, position: Vec3, rotation: Quat) -> Self {
        Self {
            position: self.position + self.rotation * position,
            rotation: (self.rotation * rotation).normalize(),
        }
    }
}

// ============================================================================
// 节点树
// ============================================================================

#[derive(Debug)]
struct Node {
    guid: Guid,
    parent: Option<NodeId>,
    /// 按 guid 升序
    children: Vec<NodeId>,
    data: NodeDataRef,
}

/// 节点树
#[derive(Debug)]
pub struct NodeTree {
    nodes: Vec<Option<Node>>,
    /// 被删除节点空出的槽位，`create_child` 优先复用
    free: Vec<NodeId>,
    by_guid: HashMap<Guid, NodeId>,
    root: NodeId,
    live: usize,
    revision: u64,
}

impl NodeTree {
    /// 创建只有根节点的树
    pub fn new(root_guid: Guid) -> Self {
        let root = NodeId(0);
        let mut by_guid = HashMap::new();
        by_guid.insert(root_guid, root);
        Self {
            nodes: vec![Some(Node {
                guid: root_guid,
                parent: None,
                children: Vec::new(),
                data: NodeDataRef::private(NodeData::default()),
            })],
            free: Vec::new(),
            by_guid,
            root,
            live: 1,
            revision: 0,
        }
    }

    /// 在 `parent` 下创建子节点
    ///
    /// 被删除节点的 `NodeId` 会被复用，删除后不要再使用旧的 id。
    pub fn create_child(&mut self, parent: NodeId, guid: Guid) -> Result<NodeId> {
        if self.by_guid.contains_key(&guid) {
            return Err(IkError::DuplicateGuid(guid));
        }

        // 子节点按 guid 有序插入
        let insert_at = {
            let parent_node = self.node(parent)?;
            parent_node
                .children
                .partition_point(|child| self.guid_of(*child) < guid)
        };

        let node = Node {
            guid,
            parent: Some(parent),
            children: Vec::new(),
            data: NodeDataRef::private(NodeData::default()),
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        self.by_guid.insert(guid, id);
        self.node_mut(parent)?.children.insert(insert_at, id);
        self.live += 1;
        self.revision += 1;
        Ok(id)
    }

    /// 删除节点及其所有后代
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<()> {
        if id == self.root {
            return Err(IkError::CannotRemoveRoot);
        }
        let parent = self.node(id)?.parent;
        let doomed = self.pre_order_from(id);

        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|child| *child != id);
        }
        for node_id in doomed {
            if let Some(node) = self.nodes[node_id.0].take() {
                self.by_guid.remove(&node.guid);
                self.free.push(node_id);
                self.live -= 1;
            }
        }
        self.revision += 1;
        Ok(())
    }

    // ========================================
    // 拓扑
    // ========================================

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ok().and_then(|node| node.parent)
    }

    /// 子节点（按 guid 升序）
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.node(id) {
            Ok(node) => &node.children,
            Err(_) => &[],
        }
    }

    pub fn guid(&self, id: NodeId) -> Option<Guid> {
        self.node(id).ok().map(|node| node.guid)
    }

    pub fn find(&self, guid: Guid) -> Option<NodeId> {
        self.by_guid.get(&guid).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// 前序遍历整棵树
    pub fn pre_order(&self) -> Vec<NodeId> {
        self.pre_order_from(self.root)
    }

    /// 前序遍历子树（显式栈，不受树深度限制）
    pub fn pre_order_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        if self.node(start).is_err() {
            return order;
        }
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        order
    }

    /// 影响岛划分的修改计数
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // ========================================
    // 节点数据
    // ========================================

    pub fn with_data<R>(&self, id: NodeId, f: impl FnOnce(&NodeData) -> R) -> Result<R> {
        Ok(self.node(id)?.data.read(f))
    }

    /// 修改节点数据；如果效应器的有无或链长发生变化，推进 revision
    pub fn with_data_mut<R>(&mut self, id: NodeId, f: impl FnOnce(&mut NodeData) -> R) -> Result<R> {
        let (result, changed) = self.node(id)?.data.write(|data| {
            let before = data.effector_key();
            let result = f(data);
            (result, before != data.effector_key())
        });
        if changed {
            self.revision += 1;
        }
        Ok(result)
    }

    pub fn position(&self, id: NodeId) -> Result<Vec3> {
        self.with_data(id, |data| data.position)
    }

    pub fn set_position(&mut self, id: NodeId, position: Vec3) -> Result<()> {
        self.node(id)?.data.write(|data| data.position = position);
        Ok(())
    }

    pub fn rotation(&self, id: NodeId) -> Result<Quat> {
        self.with_data(id, |data| data.rotation)
    }

    pub fn set_rotation(&mut self, id: NodeId, rotation: Quat) -> Result<()> {
        self.node(id)?.data.write(|data| data.rotation = rotation);
        Ok(())
    }

    pub fn set_rotation_weight(&mut self, id: NodeId, weight: f32) -> Result<()> {
        self.node(id)?.data.write(|data| data.rotation_weight = weight);
        Ok(())
    }

    pub fn user_data(&self, id: NodeId) -> Result<Option<UserData>> {
        self.with_data(id, |data| data.user_data.clone())
    }

    pub fn set_user_data(&mut self, id: NodeId, user_data: Option<UserData>) -> Result<()> {
        self.node(id)?.data.write(|data| data.user_data = user_data);
        Ok(())
    }

    // ========================================
    // 附件
    // ========================================

    pub fn attach_effector(&mut self, id: NodeId, effector: Effector) -> Result<()> {
        let guid = self.node(id)?.guid;
        self.node(id)?.data.write(|data| {
            if data.effector.is_some() {
                return Err(IkError::AlreadyHasAttachment {
                    guid,
                    kind: AttachmentKind::Effector,
                });
            }
            data.effector = Some(effector);
            Ok(())
        })?;
        self.revision += 1;
        Ok(())
    }

    pub fn detach_effector(&mut self, id: NodeId) -> Result<Option<Effector>> {
        let effector = self.node(id)?.data.write(|data| data.effector.take());
        if effector.is_some() {
            self.revision += 1;
        }
        Ok(effector)
    }

    pub fn effector(&self, id: NodeId) -> Result<Option<Effector>> {
        self.with_data(id, |data| data.effector.clone())
    }

    /// 修改已挂载的效应器；节点没有效应器时返回 `None`
    pub fn with_effector_mut<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut Effector) -> R,
    ) -> Result<Option<R>> {
        self.with_data_mut(id, |data| data.effector.as_mut().map(f))
    }

    pub fn attach_constraint(&mut self, id: NodeId, constraint: Constraint) -> Result<()> {
        let guid = self.node(id)?.guid;
        self.node(id)?.data.write(|data| {
            if data.constraint.is_some() {
                return Err(IkError::AlreadyHasAttachment {
                    guid,
                    kind: AttachmentKind::Constraint,
                });
            }
            data.constraint = Some(constraint);
            Ok(())
        })
    }

    pub fn detach_constraint(&mut self, id: NodeId) -> Result<Option<Constraint>> {
        Ok(self.node(id)?.data.write(|data| data.constraint.take()))
    }

    pub fn attach_pole(&mut self, id: NodeId, pole: Pole) -> Result<()> {
        let guid = self.node(id)?.guid;
        self.node(id)?.data.write(|data| {
            if data.pole.is_some() {
                return Err(IkError::AlreadyHasAttachment {
                    guid,
                    kind: AttachmentKind::Pole,
                });
            }
            data.pole = Some(pole);
            Ok(())
        })
    }

    pub fn detach_pole(&mut self, id: NodeId) -> Result<Option<Pole>> {
        Ok(self.node(id)?.data.write(|data| data.pole.take()))
    }

    pub fn pole(&self, id: NodeId) -> Result<Option<Pole>> {
        self.with_data(id, |data| data.pole)
    }

    // ========================================
    // 变换
    // ========================================

    /// 世界变换：从根节点到该节点依次组合本地变换
    pub fn global_transform(&self, id: NodeId) -> Result<Transform> {
        let mut path = vec![id];
        let mut current = self.node(id)?.parent;
        while let Some(parent) = current {
            path.push(parent);
            current = self.node(parent)?.parent;
        }

        let mut global = Transform::IDENTITY;
        for node_id in path.into_iter().rev() {
            let (position, rotation) = self.node(node_id)?.data.read(|data| (data.position, data.rotation));
            global = global.then(position, rotation);
        }
        Ok(global)
    }

    /// 重新计算所有节点到父节点的距离
    pub fn update_distances(&mut self) {
        for node in self.nodes.iter().flatten() {
            let has_parent = node.parent.is_some();
            node.data.write(|data| {
                data.dist_to_parent = if has_parent { data.position.length() } else { 0.0 };
            });
        }
    }

    /// 节点数据所在缓冲区的持有者数量
    pub fn data_refcount(&self, id: NodeId) -> Result<usize> {
        Ok(self.node(id)?.data.refcount())
    }

    // ========================================
    // crate 内部
    // ========================================

    pub(crate) fn data_ref(&self, id: NodeId) -> Result<&NodeDataRef> {
        Ok(&self.node(id)?.data)
    }

    /// 把节点改为指向新的缓冲区槽位，旧缓冲区的引用随之释放
    pub(crate) fn repoint(&mut self, id: NodeId, data: NodeDataRef) -> Result<()> {
        self.node_mut(id)?.data = data;
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(IkError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(IkError::NodeNotFound(id))
    }

    fn guid_of(&self, id: NodeId) -> Guid {
        self.node(id).map(|node| node.guid).unwrap_or(Guid::MAX)
    }
}
