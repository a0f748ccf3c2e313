//! 单骨骼 / 双骨骼解析解
//!
//! 岛的拓扑在 rebuild 时已经检查过：
//! - 单骨骼：槽位 0 是岛根，槽位 1 是带效应器的末端
//! - 双骨骼：槽位 0、1、2 组成无分支链，槽位 2 带效应器

use super::pose::Pose;
use super::IslandResult;
use crate::config::{SolverConfig, SolverFeatures};
use crate::tree::{NodeData, Transform};

/// 末端直接指向目标
pub(crate) fn solve_one_bone(
    nodes: &mut [NodeData],
    parent: &[usize],
    anchor: Transform,
    config: &SolverConfig,
    pose: &mut Pose,
) -> IslandResult {
    pose.load(nodes, parent, anchor);
    pose.update_targets(nodes, parent);

    if let Some(target) = pose.targets.get(1).copied().flatten() {
        let rest = pose.rest_direction(parent, 1);
        let dir = (target - pose.pos[0]).try_normalize().unwrap_or(rest);
        pose.pos[1] = pose.pos[0] + dir * nodes[1].dist_to_parent;
    }

    finish(nodes, parent, anchor, config, pose)
}

/// 余弦定理求中间关节；够不到目标时两根骨骼都指向目标
///
/// 弯曲平面由求解前的中间节点决定，链是直的时任取一个垂直方向。
pub(crate) fn solve_two_bone(
    nodes: &mut [NodeData],
    parent: &[usize],
    anchor: Transform,
    config: &SolverConfig,
    pose: &mut Pose,
) -> IslandResult {
    pose.load(nodes, parent, anchor);
    pose.update_targets(nodes, parent);

    if let Some(target) = pose.targets.get(2).copied().flatten() {
        let base = pose.pos[0];
        let a = nodes[1].dist_to_parent;
        let b = nodes[2].dist_to_parent;

        let to_target = target - base;
        let d = to_target.length();
        let dir = to_target
            .try_normalize()
            .unwrap_or_else(|| pose.rest_direction(parent, 1));

        if d >= a + b {
            pose.pos[1] = base + dir * a;
            pose.pos[2] = pose.pos[1] + dir * b;
        } else {
            let to_mid = pose.pos[1] - base;
            let bend = (to_mid - dir * to_mid.dot(dir))
                .try_normalize()
                .unwrap_or_else(|| dir.any_orthonormal_vector());

            let cos_alpha = if d > f32::EPSILON && a > f32::EPSILON {
                ((a * a + d * d - b * b) / (2.0 * a * d)).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            let sin_alpha = (1.0 - cos_alpha * cos_alpha).max(0.0).sqrt();

            pose.pos[1] = base + (dir * cos_alpha + bend * sin_alpha) * a;
            let tip_dir = (target - pose.pos[1]).try_normalize().unwrap_or(dir);
            pose.pos[2] = pose.pos[1] + tip_dir * b;
        }
    }

    finish(nodes, parent, anchor, config, pose)
}

fn finish(
    nodes: &mut [NodeData],
    parent: &[usize],
    anchor: Transform,
    config: &SolverConfig,
    pose: &mut Pose,
) -> IslandResult {
    let converged = pose.is_converged(config.tolerance_squared());
    let rotations = config.has(SolverFeatures::JOINT_ROTATIONS);
    if rotations {
        pose.joint_rotations(parent);
    }
    pose.store(nodes, parent, anchor, rotations);
    IslandResult {
        converged,
        iterations: 1,
    }
}
