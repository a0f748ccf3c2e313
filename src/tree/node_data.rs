//! 节点数据与共享缓冲区
//!
//! 节点数据不直接存放在节点里，而是存放在一块引用计数的缓冲区中：
//! - 新建节点时，缓冲区只有这一个节点（私有缓冲区）
//! - 扁平化时，岛内所有节点的数据拷贝进同一块新缓冲区，节点改为指向新缓冲区的槽位
//! - 缓冲区由节点和岛共同持有，最后一个持有者释放时才会被回收
//!
//! 这样求解器内循环读写的就是节点树本身的数据，不需要额外回写。

use std::sync::{Arc, RwLock};

use glam::{Quat, Vec3};

use super::attachment::{Constraint, Effector, Pole, UserData};

/// 共享节点数据缓冲区
pub type SharedNodeData = Arc<RwLock<Vec<NodeData>>>;

/// 单个节点的数据
#[derive(Clone, Debug)]
pub struct NodeData {
    /// 相对父节点的位置
    pub position: Vec3,
    /// 相对父节点的旋转
    pub rotation: Quat,
    /// 到父节点的距离，求解前由 `NodeTree::update_distances` 重新计算
    pub dist_to_parent: f32,
    /// 关节旋转的分配权重
    pub rotation_weight: f32,
    pub user_data: Option<UserData>,

    pub effector: Option<Effector>,
    pub constraint: Option<Constraint>,
    pub pole: Option<Pole>,
}

impl Default for NodeData {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            dist_to_parent: 0.0,
            rotation_weight: 1.0,
            user_data: None,
            effector: None,
            constraint: None,
            pole: None,
        }
    }
}

impl NodeData {
    /// 影响岛划分的效应器信息：(是否有效应器, 链长)
    #[inline]
    pub(crate) fn effector_key(&self) -> (bool, u16) {
        match &self.effector {
            Some(effector) => (true, effector.chain_length),
            None => (false, 0),
        }
    }
}

/// 节点对共享缓冲区中某个槽位的引用
#[derive(Clone, Debug)]
pub(crate) struct NodeDataRef {
    buffer: SharedNodeData,
    index: usize,
}

impl NodeDataRef {
    /// 只包含一个节点的私有缓冲区
    pub fn private(data: NodeData) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(vec![data])),
            index: 0,
        }
    }

    /// 指向共享缓冲区的某个槽位
    pub fn shared(buffer: &SharedNodeData, index: usize) -> Self {
        Self {
            buffer: Arc::clone(buffer),
            index,
        }
    }

    #[inline]
    pub fn read<R>(&self, f: impl FnOnce(&NodeData) -> R) -> R {
        let guard = self.buffer.read().unwrap_or_else(|e| e.into_inner());
        f(&guard[self.index])
    }

    #[inline]
    pub fn write<R>(&self, f: impl FnOnce(&mut NodeData) -> R) -> R {
        let mut guard = self.buffer.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard[self.index])
    }

    /// 是否指向岛的共享缓冲区（私有缓冲区只有一个节点）
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.buffer.read().unwrap_or_else(|e| e.into_inner()).len() > 1
    }

    /// 缓冲区当前的持有者数量
    #[inline]
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_buffer() {
        let data_ref = NodeDataRef::private(NodeData::default());
        assert_eq!(data_ref.refcount(), 1);
        assert!(!data_ref.is_shared());

        data_ref.write(|data| data.position = Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(data_ref.read(|data| data.position), Vec3::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn test_shared_buffer_refcount() {
        let buffer: SharedNodeData =
            Arc::new(RwLock::new(vec![NodeData::default(), NodeData::default()]));
        let a = NodeDataRef::shared(&buffer, 0);
        let b = NodeDataRef::shared(&buffer, 1);
        assert_eq!(a.refcount(), 3);
        assert_eq!(b.refcount(), 3);
        assert!(b.is_shared());

        // 通过一个引用写入，另一个持有者能看到
        b.write(|data| data.rotation_weight = 0.5);
        let guard = buffer.read().unwrap_or_else(|e| e.into_inner());
        assert!((guard[1].rotation_weight - 0.5).abs() < 1e-6);
        drop(guard);

        drop(a);
        drop(b);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_effector_key() {
        let mut data = NodeData::default();
        assert_eq!(data.effector_key(), (false, 0));
        data.effector = Some(Effector::default().with_chain_length(3));
        assert_eq!(data.effector_key(), (true, 3));
    }
}
