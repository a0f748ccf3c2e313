//! 节点附件 - 效应器、约束、极向量
//!
//! 附件独立创建，同一时间只能挂在一个节点上。
//! 同一节点重复挂载同类附件会返回 `AlreadyHasAttachment`。

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use glam::{Quat, Vec3};

/// 宿主程序关联到节点上的任意数据
pub type UserData = Arc<dyn Any + Send + Sync>;

/// 自定义约束函数：输入本次迭代的旋转增量，返回修正后的增量
pub type ConstraintFn = Arc<dyn Fn(Quat) -> Quat + Send + Sync>;

// ============================================================================
// 附件类型
// ============================================================================

/// 附件种类（用于错误信息）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    Effector,
    Constraint,
    Pole,
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttachmentKind::Effector => "效应器",
            AttachmentKind::Constraint => "约束",
            AttachmentKind::Pole => "极向量",
        };
        f.write_str(name)
    }
}

// ============================================================================
// 效应器
// ============================================================================

bitflags! {
    /// 效应器标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EffectorFlags: u8 {
        /// weight < 1 时以链底节点为圆心做 nlerp，过渡更自然
        const WEIGHT_NLERP = 1 << 0;
    }
}

/// 效应器
#[derive(Clone, Debug)]
pub struct Effector {
    /// 目标位置（世界空间）
    pub target_position: Vec3,
    /// 目标旋转（世界空间）
    pub target_rotation: Quat,
    /// 当前位置与目标位置之间的混合系数 [0, 1]
    pub weight: f32,
    /// 目标旋转的强度
    pub rotation_weight: f32,
    /// 目标旋转每向上一节骨骼的衰减
    pub rotation_decay: f32,
    /// 链长（骨骼数），0 表示一直到根节点
    pub chain_length: u16,
    pub flags: EffectorFlags,

    /// 每次求解前根据 weight 计算出的实际目标
    pub(crate) actual_target: Vec3,
}

impl Default for Effector {
    fn default() -> Self {
        Self {
            target_position: Vec3::ZERO,
            target_rotation: Quat::IDENTITY,
            weight: 1.0,
            rotation_weight: 1.0,
            rotation_decay: 0.25,
            chain_length: 0,
            flags: EffectorFlags::empty(),
            actual_target: Vec3::ZERO,
        }
    }
}

impl Effector {
    pub fn new(target_position: Vec3) -> Self {
        Self {
            target_position,
            ..Default::default()
        }
    }

    pub fn with_chain_length(mut self, chain_length: u16) -> Self {
        self.chain_length = chain_length;
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight.clamp(0.0, 1.0);
        self
    }

    /// 上一次求解使用的实际目标
    #[inline]
    pub fn actual_target(&self) -> Vec3 {
        self.actual_target
    }

    #[inline]
    pub fn is_weight_nlerp(&self) -> bool {
        self.flags.contains(EffectorFlags::WEIGHT_NLERP)
    }
}

// ============================================================================
// 约束
// ============================================================================

/// 约束种类
#[derive(Clone)]
pub enum ConstraintKind {
    /// 骨骼保持求解前的全局朝向
    Stiff,
    /// 由宿主提供的约束函数
    Custom(ConstraintFn),
}

impl fmt::Debug for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::Stiff => f.write_str("Stiff"),
            ConstraintKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// 约束链
///
/// 多个约束通过 `next` 串起来，按顺序依次作用在旋转增量上。
#[derive(Clone, Debug)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub next: Option<Box<Constraint>>,
}

impl Constraint {
    pub fn stiff() -> Self {
        Self {
            kind: ConstraintKind::Stiff,
            next: None,
        }
    }

    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(Quat) -> Quat + Send + Sync + 'static,
    {
        Self {
            kind: ConstraintKind::Custom(Arc::new(func)),
            next: None,
        }
    }

    /// 在链尾追加一个约束
    pub fn then(mut self, next: Constraint) -> Self {
        let tail = match self.next.take() {
            Some(link) => (*link).then(next),
            None => next,
        };
        self.next = Some(Box::new(tail));
        self
    }

    /// 依次应用链上的所有约束
    pub fn apply(&self, delta: Quat) -> Quat {
        let mut current = delta;
        let mut link = Some(self);
        while let Some(constraint) = link {
            current = match &constraint.kind {
                ConstraintKind::Stiff => Quat::IDENTITY,
                ConstraintKind::Custom(func) => func(current),
            };
            link = constraint.next.as_deref();
        }
        current
    }

    /// 链上约束的数量
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut link = Some(self);
        while let Some(constraint) = link {
            count += 1;
            link = constraint.next.as_deref();
        }
        count
    }

    /// 约束链至少包含自身，永远非空
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }
}

// ============================================================================
// 极向量
// ============================================================================

/// 极向量（用于消除链的扭转歧义，目前只保存数据）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pole {
    /// 绕链轴的附加角度（弧度）
    pub angle: f32,
    /// 极点位置（世界空间）
    pub position: Vec3,
}
