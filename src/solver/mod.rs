//! 求解器 - 标记、拆分、扁平化、求解的调度
//!
//! 核心设计思想：
//! - Solver 持有节点树和当前的岛列表
//! - rebuild: 标记 -> 规划岛 -> 扁平化，失败时保留上一次成功的岛
//! - solve: 按构建顺序求解每个岛，依赖其他岛的岛总排在后面
//! - 求解结果直接写入节点树的数据缓冲区，不需要额外回写

mod bone;
mod fabrik;
mod island;
mod marking;
mod pose;

pub use island::{Chain, IndexData, Island};

use std::io::Write;

use glam::{Quat, Vec3};
use rayon::prelude::*;

use crate::config::{Algorithm, SolverConfig};
use crate::tree::{Guid, NodeData, NodeId, NodeTree, UserData};
use crate::{IkError, Result};

// ============================================================================
// 结果类型
// ============================================================================

/// rebuild 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildStatus {
    /// 重新构建了岛
    Rebuilt { islands: usize },
    /// 树上没有效应器，之前的岛保持不变
    NoEffectors,
}

/// 单个岛的求解结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IslandResult {
    pub converged: bool,
    pub iterations: u32,
}

/// 一次 solve 的结果
///
/// 没有收敛不是错误，只说明有目标够不到或迭代次数不够。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SolveResult {
    /// 所有岛都收敛
    pub converged: bool,
    /// 各岛中最多的迭代次数
    pub iterations: u32,
    pub converged_islands: usize,
    pub island_count: usize,
}

/// 遍历回调看到的节点
#[derive(Clone, Debug)]
pub struct NodeView {
    pub id: NodeId,
    pub guid: Guid,
    /// 本地位置
    pub position: Vec3,
    /// 本地旋转
    pub rotation: Quat,
    pub user_data: Option<UserData>,
}

impl NodeView {
    pub(crate) fn new(id: NodeId, guid: Guid, data: &NodeData) -> Self {
        Self {
            id,
            guid,
            position: data.position,
            rotation: data.rotation,
            user_data: data.user_data.clone(),
        }
    }
}

/// 上一次成功 rebuild 时的状态
#[derive(Clone, Copy, Debug)]
struct BuildStamp {
    revision: u64,
    algorithm: Algorithm,
}

// ============================================================================
// 求解器
// ============================================================================

/// IK 求解器
#[derive(Debug, Default)]
pub struct Solver {
    config: SolverConfig,
    tree: Option<NodeTree>,
    islands: Vec<Island>,
    built: Option<BuildStamp>,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            tree: None,
            islands: Vec::new(),
            built: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// 修改算法后需要重新 rebuild
    #[inline]
    pub fn config_mut(&mut self) -> &mut SolverConfig {
        &mut self.config
    }

    /// 接管节点树，返回之前持有的树
    ///
    /// 旧的岛引用的是旧树的节点，一并丢弃。
    pub fn set_tree(&mut self, tree: NodeTree) -> Option<NodeTree> {
        self.islands.clear();
        self.built = None;
        self.tree.replace(tree)
    }

    /// 交还节点树
    ///
    /// 岛作为快照保留（缓冲区可以比节点树活得更久），
    /// 重新设置节点树并 rebuild 之后才能再次求解。
    pub fn unlink_tree(&mut self) -> Option<NodeTree> {
        self.built = None;
        self.tree.take()
    }

    #[inline]
    pub fn tree(&self) -> Option<&NodeTree> {
        self.tree.as_ref()
    }

    /// 可变访问节点树；修改拓扑或效应器后需要重新 rebuild
    #[inline]
    pub fn tree_mut(&mut self) -> Option<&mut NodeTree> {
        self.tree.as_mut()
    }

    #[inline]
    pub fn islands(&self) -> &[Island] {
        &self.islands
    }

    /// 重新标记并构建所有岛
    ///
    /// 失败时（内存不足、拓扑不被当前算法支持）节点树和之前的岛保持不变。
    pub fn rebuild(&mut self) -> Result<RebuildStatus> {
        let tree = self.tree.as_mut().ok_or(IkError::SolverHasNoTree)?;

        let effectors = marking::effector_nodes(tree)?;
        if effectors.is_empty() {
            log::warn!("[IK] 节点树上没有效应器，保留之前的 {} 个岛", self.islands.len());
            return Ok(RebuildStatus::NoEffectors);
        }

        let marks = marking::mark_nodes(tree, &effectors)?;
        let islands = island::build_islands(tree, &marks, self.config.algorithm)
            .inspect_err(|e| log::error!("[IK] rebuild 失败: {}", e))?;

        if self.config.debug_log {
            log::debug!(
                "[IK] rebuild: 效应器={}, 标记节点={}, 岛={}",
                effectors.len(),
                marks.len(),
                islands.len()
            );
            for island in &islands {
                log::debug!("[IK]   岛根={}, 节点={:?}", island.base_guid(), island.guids());
            }
        }

        let count = islands.len();
        self.islands = islands;
        self.built = Some(BuildStamp {
            revision: tree.revision(),
            algorithm: self.config.algorithm,
        });
        Ok(RebuildStatus::Rebuilt { islands: count })
    }

    /// 按依赖顺序求解所有岛，结果写回节点树
    pub fn solve(&mut self) -> Result<SolveResult> {
        let tree = self.tree.as_mut().ok_or(IkError::SolverHasNoTree)?;
        let stamp = self.built.ok_or(IkError::NotBuilt)?;
        if stamp.revision != tree.revision() || stamp.algorithm != self.config.algorithm {
            return Err(IkError::StaleIslands);
        }

        tree.update_distances();

        let mut result = SolveResult {
            converged: true,
            island_count: self.islands.len(),
            ..Default::default()
        };
        for island in &mut self.islands {
            let island_result = island.solve(tree, &self.config)?;
            result.iterations = result.iterations.max(island_result.iterations);
            if island_result.converged {
                result.converged_islands += 1;
            } else {
                result.converged = false;
            }
        }

        if self.config.debug_log {
            log::debug!(
                "[FABRIK] 求解完成: 岛={}, 收敛={}, 迭代={}",
                result.island_count,
                result.converged_islands,
                result.iterations
            );
        }
        Ok(result)
    }

    // ========================================
    // 遍历
    // ========================================

    /// 前序访问节点树上的所有节点
    pub fn iterate_all_nodes(&self, mut f: impl FnMut(NodeView)) {
        let Some(tree) = &self.tree else { return };
        for id in tree.pre_order() {
            let Some(guid) = tree.guid(id) else { continue };
            if let Ok(view) = tree.with_data(id, |data| NodeView::new(id, guid, data)) {
                f(view);
            }
        }
    }

    /// 访问被求解器改动的节点（不含岛根）
    pub fn iterate_affected_nodes(&self, mut f: impl FnMut(NodeView)) {
        for island in &self.islands {
            island.visit(1..island.len(), &mut f);
        }
    }

    /// 访问所有岛根（通常由外部驱动，例如父级骨骼区域）
    pub fn iterate_base_nodes(&self, mut f: impl FnMut(NodeView)) {
        for island in &self.islands {
            island.visit(0..1, &mut f);
        }
    }

    /// 输出 Graphviz 调试图
    pub fn write_dot<W: Write>(&self, writer: &mut W) -> Result<()> {
        let tree = self.tree.as_ref().ok_or(IkError::SolverHasNoTree)?;
        crate::dot::write_dot(tree, &self.islands, writer)
    }
}

/// 并行求解多个互不相关的骨骼（每个求解器持有各自的节点树）
pub fn solve_batch(solvers: &mut [Solver]) -> Vec<Result<SolveResult>> {
    solvers.par_iter_mut().map(Solver::solve).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{fixtures, Effector};
    use std::sync::Mutex;

    /// 收集日志，检查输出级别
    struct CaptureLogger;

    static CAPTURED: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());
    static LOGGER: CaptureLogger = CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            CAPTURED
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((record.level(), record.args().to_string()));
        }

        fn flush(&self) {}
    }

    fn solver_with(tree: NodeTree) -> Solver {
        let mut solver = Solver::new(SolverConfig::default());
        solver.set_tree(tree);
        solver
    }

    #[test]
    fn test_solve_requires_rebuild() {
        let mut solver = Solver::new(SolverConfig::default());
        assert!(matches!(solver.rebuild(), Err(IkError::SolverHasNoTree)));
        assert!(matches!(solver.solve(), Err(IkError::SolverHasNoTree)));

        solver.set_tree(fixtures::weird_tree());
        assert!(matches!(solver.solve(), Err(IkError::NotBuilt)));

        assert_eq!(solver.rebuild().unwrap(), RebuildStatus::Rebuilt { islands: 2 });
        assert!(solver.solve().is_ok());
    }

    #[test]
    fn test_stale_islands() {
        let mut solver = solver_with(fixtures::weird_tree());
        solver.rebuild().unwrap();

        let tree = solver.tree_mut().unwrap();
        let node = fixtures::node(tree, 11);
        tree.with_effector_mut(node, |e| e.chain_length = 2).unwrap();
        assert!(matches!(solver.solve(), Err(IkError::StaleIslands)));

        solver.rebuild().unwrap();
        assert!(solver.solve().is_ok());

        solver.config_mut().algorithm = Algorithm::TwoBone;
        assert!(matches!(solver.solve(), Err(IkError::StaleIslands)));
    }

    #[test]
    fn test_no_effectors_keeps_islands() {
        let mut solver = solver_with(fixtures::chain(4));
        assert_eq!(solver.rebuild().unwrap(), RebuildStatus::NoEffectors);
        assert!(solver.islands().is_empty());
        assert!(matches!(solver.solve(), Err(IkError::NotBuilt)));
    }

    #[test]
    fn test_no_effectors_warns() {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);

        let mut solver = solver_with(fixtures::chain(3));
        assert_eq!(solver.rebuild().unwrap(), RebuildStatus::NoEffectors);

        let captured = CAPTURED.lock().unwrap_or_else(|e| e.into_inner());
        assert!(captured
            .iter()
            .any(|(level, message)| *level == log::Level::Warn && message.contains("没有效应器")));
    }

    #[test]
    fn test_failed_rebuild_keeps_old_islands() {
        let mut solver = solver_with(fixtures::weird_tree());
        solver.rebuild().unwrap();
        let before: Vec<Vec<Guid>> = solver.islands().iter().map(|i| i.guids().to_vec()).collect();

        solver.config_mut().algorithm = Algorithm::OneBone;
        assert!(matches!(solver.rebuild(), Err(IkError::UnsupportedTopology { .. })));

        let after: Vec<Vec<Guid>> = solver.islands().iter().map(|i| i.guids().to_vec()).collect();
        assert_eq!(before, after);
        // 节点仍然指向旧岛的缓冲区
        assert_eq!(solver.islands()[0].buffer_refcount(), 10);
    }

    #[test]
    fn test_iterate_nodes() {
        let mut solver = solver_with(fixtures::weird_tree());
        solver.rebuild().unwrap();

        let mut all = Vec::new();
        solver.iterate_all_nodes(|view| all.push(view.guid));
        assert_eq!(all, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let mut bases = Vec::new();
        solver.iterate_base_nodes(|view| bases.push(view.guid));
        assert_eq!(bases, vec![1, 3]);

        let mut affected = Vec::new();
        solver.iterate_affected_nodes(|view| affected.push(view.guid));
        assert_eq!(affected, vec![2, 5, 6, 7, 8, 9, 10, 11, 4]);
    }

    #[test]
    fn test_dependent_island_follows_parent() {
        // 0 - 1 - 2 - 3 - 4，效应器 2（链长 2）和 4（链长 1）
        // 第二个岛以 3 为根，锚点是第一个岛刚解出的 2
        let mut tree = fixtures::chain(5);
        fixtures::attach(&mut tree, 2, 2);
        fixtures::attach(&mut tree, 4, 1);
        let two = fixtures::node(&tree, 2);
        let four = fixtures::node(&tree, 4);
        tree.with_effector_mut(two, |e| e.target_position = Vec3::new(1.0, 1.0, 0.0))
            .unwrap();
        tree.with_effector_mut(four, |e| e.target_position = Vec3::new(1.0, 1.0, 0.0))
            .unwrap();

        let mut solver = solver_with(tree);
        assert_eq!(solver.rebuild().unwrap(), RebuildStatus::Rebuilt { islands: 2 });
        let result = solver.solve().unwrap();
        assert_eq!(result.island_count, 2);

        let tree = solver.tree().unwrap();
        let two_global = tree.global_transform(two).unwrap().position;
        let four_global = tree.global_transform(four).unwrap().position;
        assert!(two_global.distance(Vec3::new(1.0, 1.0, 0.0)) < 1e-3);
        // 4 所在的岛以 3 为根，3 跟随 2 移动后仍保持骨骼长度
        let three = tree.global_transform(fixtures::node(tree, 3)).unwrap().position;
        assert!((three.distance(two_global) - 1.0).abs() < 1e-4);
        assert!((four_global.distance(three) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_solve_batch() {
        let mut solvers: Vec<Solver> = (0..4)
            .map(|i| {
                let mut tree = fixtures::chain(4);
                let tip = fixtures::node(&tree, 3);
                let target = Vec3::new(1.0 + i as f32 * 0.2, 1.0, 0.0);
                tree.attach_effector(tip, Effector::new(target)).unwrap();
                let mut solver = solver_with(tree);
                solver.rebuild().unwrap();
                solver
            })
            .collect();

        let results = solve_batch(&mut solvers);
        assert_eq!(results.len(), 4);
        for result in results {
            assert!(result.unwrap().converged);
        }
    }

    #[test]
    fn test_write_dot() {
        let mut solver = solver_with(fixtures::two_arms_meet());
        solver.rebuild().unwrap();
        let mut out = Vec::new();
        solver.write_dot(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("graph"));
        assert!(text.contains("n2 -- n3"));
    }
}
