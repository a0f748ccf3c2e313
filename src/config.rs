//! 求解器配置
//!
//! 所有参数扁平化，由调用方显式传给 `Solver::new`，不使用全局配置。

use bitflags::bitflags;
use glam::Vec3;

bitflags! {
    /// 求解器可选功能
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SolverFeatures: u16 {
        /// 反向阶段调用节点上的约束
        const CONSTRAINTS = 1 << 0;
        /// 正向阶段让骨骼朝向效应器的目标旋转
        const TARGET_ROTATIONS = 1 << 1;
        /// 求解结束后根据位移计算关节旋转
        const JOINT_ROTATIONS = 1 << 2;
    }
}

/// 求解算法（封闭集合，配置时选定）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Algorithm {
    /// 任意树结构
    #[default]
    Fabrik,
    /// 每个岛只能是一根骨骼（2 个节点）
    OneBone,
    /// 每个岛只能是无分支的两根骨骼（3 个节点）
    TwoBone,
}

/// 求解器配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct SolverConfig {
    // ========== 算法 ==========
    /// 求解算法，默认 FABRIK
    pub algorithm: Algorithm,

    // ========== 迭代 ==========
    /// 最大迭代次数，默认 20
    /// 越大结果越精确；一般 5 次左右已经足够
    pub max_iterations: u32,
    /// 收敛容差（世界单位），默认 1e-3
    /// 所有效应器与目标的距离都小于此值时提前结束
    pub tolerance: f32,

    // ========== 功能 ==========
    /// 可选功能，默认全部关闭
    pub features: SolverFeatures,
    /// 目标旋转对应的骨骼朝向轴，默认 +Z
    pub target_rotation_axis: Vec3,

    // ========== 调试 ==========
    /// 是否输出调试日志，默认 false
    pub debug_log: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Fabrik,

            // ====== 迭代 ======
            // 典型值，与大多数游戏中间件一致
            max_iterations: 20,
            // 建议取世界单位的 1/100 左右
            tolerance: 1e-3,

            // ====== 功能 ======
            features: SolverFeatures::empty(),
            target_rotation_axis: Vec3::Z,

            // ====== 调试 ======
            debug_log: false,
        }
    }
}

impl SolverConfig {
    #[inline]
    pub fn tolerance_squared(&self) -> f32 {
        self.tolerance * self.tolerance
    }

    #[inline]
    pub fn has(&self, feature: SolverFeatures) -> bool {
        self.features.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SolverConfig::default();
        assert_eq!(config.algorithm, Algorithm::Fabrik);
        assert_eq!(config.max_iterations, 20);
        assert!((config.tolerance_squared() - 1e-6).abs() < 1e-9);
        assert!(!config.has(SolverFeatures::CONSTRAINTS));
    }

    #[test]
    fn test_feature_flags() {
        let mut config = SolverConfig::default();
        config.features |= SolverFeatures::JOINT_ROTATIONS | SolverFeatures::CONSTRAINTS;
        assert!(config.has(SolverFeatures::JOINT_ROTATIONS));
        assert!(config.has(SolverFeatures::CONSTRAINTS));
        assert!(!config.has(SolverFeatures::TARGET_ROTATIONS));
    }
}
