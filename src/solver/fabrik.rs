//! FABRIK 求解器
//!
//! 在扁平化的岛上迭代：
//! - 正向阶段：按后序从末端往根方向，把每个节点钉到目标上，再给父节点提出新位置
//! - 反向阶段：按前序从根往末端，保持骨骼长度把节点重新摆回去
//! - 所有效应器都在容差内或达到最大迭代次数时结束
//!
//! 分支节点的目标是所有子节点提议位置（以及自身效应器目标）的平均值。

use glam::{Quat, Vec3};

use super::island::IndexData;
use super::pose::Pose;
use super::IslandResult;
use crate::config::{SolverConfig, SolverFeatures};
use crate::tree::{NodeData, Transform};

/// 求解一个岛
pub(crate) fn solve(
    nodes: &mut [NodeData],
    parent: &[usize],
    indices: &[IndexData],
    anchor: Transform,
    config: &SolverConfig,
    pose: &mut Pose,
) -> IslandResult {
    pose.load(nodes, parent, anchor);
    pose.update_targets(nodes, parent);

    let tolerance_squared = config.tolerance_squared();
    let mut iterations = 0;
    for _ in 0..config.max_iterations {
        forward(nodes, parent, indices, config, pose);
        backward(nodes, parent, config, pose);
        iterations += 1;
        if pose.is_converged(tolerance_squared) {
            break;
        }
    }
    let converged = pose.is_converged(tolerance_squared);

    let rotations = config.has(SolverFeatures::JOINT_ROTATIONS);
    if rotations {
        pose.joint_rotations(parent);
    }
    pose.store(nodes, parent, anchor, rotations);

    IslandResult {
        converged,
        iterations,
    }
}

// ============================================================================
// 正向阶段
// ============================================================================

/// 末端 -> 根
fn forward(
    nodes: &[NodeData],
    parent: &[usize],
    indices: &[IndexData],
    config: &SolverConfig,
    pose: &mut Pose,
) {
    pose.accum_pos.fill(Vec3::ZERO);
    pose.accum_count.fill(0);
    pose.accum_dir.fill(Vec3::ZERO);
    pose.accum_decay.fill(0.0);
    pose.accum_dir_count.fill(0);

    let target_rotations = config.has(SolverFeatures::TARGET_ROTATIONS);

    for index in indices {
        let i = index.post_node;
        // 岛根固定不动
        if i == 0 {
            continue;
        }
        let p = parent[i];

        // 子节点提议的位置与自身效应器目标取平均
        let mut sum = pose.accum_pos[i];
        let mut count = pose.accum_count[i];
        if let Some(target) = pose.targets[i] {
            sum += target;
            count += 1;
        }
        let target = if count > 0 {
            sum / count as f32
        } else {
            pose.pos[i]
        };
        pose.pos[i] = target;

        let rest = pose.rest_direction(parent, i);
        let mut dir = (pose.pos[p] - target).try_normalize().unwrap_or(-rest);

        if target_rotations {
            dir = blend_target_rotation(&nodes[i], config, pose, i, p, dir);
        }

        pose.accum_pos[p] += target + dir * nodes[i].dist_to_parent;
        pose.accum_count[p] += 1;
    }
}

/// 让骨骼朝向效应器的目标旋转
///
/// 效应器的朝向沿链向上传递，每经过一节骨骼衰减 `rotation_decay`，
/// 有多个来源时取平均。返回混合后的 子 -> 父 方向。
fn blend_target_rotation(
    node: &NodeData,
    config: &SolverConfig,
    pose: &mut Pose,
    i: usize,
    p: usize,
    dir: Vec3,
) -> Vec3 {
    let mut wanted = pose.accum_dir[i];
    let mut decay = pose.accum_decay[i];
    let mut count = pose.accum_dir_count[i];
    if let Some(effector) = &node.effector {
        let forward = effector.target_rotation * config.target_rotation_axis;
        wanted += -forward * effector.rotation_weight;
        decay += effector.rotation_decay;
        count += 1;
    }
    if count == 0 {
        return dir;
    }

    let wanted = wanted / count as f32;
    let decay = (decay / count as f32).clamp(0.0, 1.0);
    pose.accum_dir[p] += wanted * (1.0 - decay);
    pose.accum_decay[p] += decay;
    pose.accum_dir_count[p] += 1;

    let strength = (wanted.length() * node.rotation_weight).clamp(0.0, 1.0);
    match wanted.try_normalize() {
        Some(wanted) if strength > 0.0 => dir.lerp(wanted, strength).try_normalize().unwrap_or(dir),
        _ => dir,
    }
}

// ============================================================================
// 反向阶段
// ============================================================================

/// 根 -> 末端（前序，父节点总在子节点之前）
fn backward(nodes: &[NodeData], parent: &[usize], config: &SolverConfig, pose: &mut Pose) {
    let constraints = config.has(SolverFeatures::CONSTRAINTS);

    for i in 1..pose.len() {
        let p = parent[i];
        let rest = pose.rest_direction(parent, i);
        let mut dir = (pose.pos[i] - pose.pos[p]).try_normalize().unwrap_or(rest);

        if constraints {
            if let Some(constraint) = &nodes[i].constraint {
                let delta = Quat::from_rotation_arc(rest, dir);
                dir = (constraint.apply(delta) * rest).try_normalize().unwrap_or(rest);
            }
        }

        pose.pos[i] = pose.pos[p] + dir * nodes[i].dist_to_parent;
    }
}
