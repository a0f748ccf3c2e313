//! IK 引擎 - 基于 FABRIK 的层级骨骼反向动力学求解器
//!
//! 整体流程：
//! - NodeTree: 可变的节点树（关节层级）
//! - 标记：从每个效应器向根方向标记参与求解的节点
//! - 拆分：按分支点和链长限制把树拆成若干独立的岛（Island）
//! - 扁平化：每个岛的节点数据拷贝进一块连续、引用计数的缓冲区
//! - 求解：按依赖顺序对每个岛执行 FABRIK 迭代，结果写回节点树

pub mod config;
pub mod dot;
pub mod solver;
pub mod tree;

use std::collections::TryReserveError;

use thiserror::Error;

pub use config::{Algorithm, SolverConfig, SolverFeatures};
pub use solver::{
    solve_batch, Chain, IndexData, Island, IslandResult, NodeView, RebuildStatus, SolveResult,
    Solver,
};
pub use tree::{
    AttachmentKind, Constraint, ConstraintFn, ConstraintKind, Effector, EffectorFlags, Guid,
    NodeData, NodeId, NodeTree, Pole, Transform, UserData,
};

// ============================================================================
// 错误类型
// ============================================================================

/// IK 引擎错误
#[derive(Debug, Error)]
pub enum IkError {
    /// 标记/拆分/扁平化过程中内存分配失败
    #[error("内存不足: {0}")]
    OutOfMemory(#[from] TryReserveError),

    /// 节点已经挂载了同类附件
    #[error("节点 {guid} 已经挂载了 {kind}")]
    AlreadyHasAttachment { guid: Guid, kind: AttachmentKind },

    #[error("节点不存在: {0:?}")]
    NodeNotFound(NodeId),

    #[error("重复的节点 guid: {0}")]
    DuplicateGuid(Guid),

    #[error("不能删除根节点")]
    CannotRemoveRoot,

    /// 求解器没有设置节点树
    #[error("求解器没有节点树")]
    SolverHasNoTree,

    /// 求解前没有成功执行过 rebuild
    #[error("求解前必须先成功 rebuild")]
    NotBuilt,

    /// 节点树的拓扑或效应器在上次 rebuild 之后发生了变化
    #[error("节点树在上次 rebuild 之后发生了变化，需要重新 rebuild")]
    StaleIslands,

    #[error("算法 {algorithm:?} 不支持当前拓扑: {reason}")]
    UnsupportedTopology { algorithm: Algorithm, reason: String },

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IkError>;
