//! 求解用的全局姿态缓存
//!
//! 每个岛在 rebuild 时一次性分配好，求解过程中不再分配内存。
//! 所有数组都按岛内槽位（前序）索引。

use glam::{Quat, Vec3, Vec4};

use crate::tree::{NodeData, Transform};
use crate::Result;

/// 分配长度为 `len` 的数组，分配失败时返回 OutOfMemory
pub(crate) fn filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut values = Vec::new();
    values.try_reserve_exact(len)?;
    values.resize(len, value);
    Ok(values)
}

#[derive(Debug, Clone)]
pub(crate) struct Pose {
    /// 当前全局位置/旋转
    pub pos: Vec<Vec3>,
    pub rot: Vec<Quat>,
    /// 求解前的全局位置/旋转
    pub initial_pos: Vec<Vec3>,
    pub initial_rot: Vec<Quat>,
    /// 效应器的实际目标，没有效应器的槽位为 None
    pub targets: Vec<Option<Vec3>>,

    // 正向阶段的累加器
    pub accum_pos: Vec<Vec3>,
    pub accum_count: Vec<u32>,
    pub accum_dir: Vec<Vec3>,
    pub accum_decay: Vec<f32>,
    pub accum_dir_count: Vec<u32>,

    // 关节旋转阶段
    pub delta_sum: Vec<Vec4>,
    pub delta_count: Vec<u32>,
}

impl Pose {
    pub fn with_len(len: usize) -> Result<Self> {
        Ok(Self {
            pos: filled(len, Vec3::ZERO)?,
            rot: filled(len, Quat::IDENTITY)?,
            initial_pos: filled(len, Vec3::ZERO)?,
            initial_rot: filled(len, Quat::IDENTITY)?,
            targets: filled(len, None)?,
            accum_pos: filled(len, Vec3::ZERO)?,
            accum_count: filled(len, 0)?,
            accum_dir: filled(len, Vec3::ZERO)?,
            accum_decay: filled(len, 0.0)?,
            accum_dir_count: filled(len, 0)?,
            delta_sum: filled(len, Vec4::ZERO)?,
            delta_count: filled(len, 0)?,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pos.len()
    }

    /// 由本地变换计算全局变换，`anchor` 是岛根节点父节点的全局变换
    pub fn load(&mut self, nodes: &[NodeData], parent: &[usize], anchor: Transform) {
        let Some(base) = nodes.first() else { return };
        let base_global = anchor.then(base.position, base.rotation);
        self.pos[0] = base_global.position;
        self.rot[0] = base_global.rotation;

        for i in 1..self.len() {
            let p = parent[i];
            self.pos[i] = self.pos[p] + self.rot[p] * nodes[i].position;
            self.rot[i] = (self.rot[p] * nodes[i].rotation).normalize();
        }

        self.initial_pos.copy_from_slice(&self.pos);
        self.initial_rot.copy_from_slice(&self.rot);
    }

    /// 计算每个效应器本次求解的实际目标，并回写到效应器上
    ///
    /// 岛根节点上的效应器不参与求解。
    pub fn update_targets(&mut self, nodes: &mut [NodeData], parent: &[usize]) {
        self.targets[0] = None;
        for i in 1..self.len() {
            let Some(effector) = nodes[i].effector.as_mut() else {
                self.targets[i] = None;
                continue;
            };

            let tip = self.pos[i];
            let weight = effector.weight.clamp(0.0, 1.0);
            let mut actual = tip + (effector.target_position - tip) * weight;

            if effector.is_weight_nlerp() && weight < 1.0 {
                let base = self.pos[chain_base(parent, i, effector.chain_length)];
                let distance = (effector.target_position - base).length() * weight
                    + (tip - base).length() * (1.0 - weight);
                if let Some(dir) = (actual - base).try_normalize() {
                    actual = base + dir * distance;
                }
            }

            effector.actual_target = actual;
            self.targets[i] = Some(actual);
        }
    }

    /// 所有效应器都在容差范围内（比较距离平方）
    pub fn is_converged(&self, tolerance_squared: f32) -> bool {
        self.targets
            .iter()
            .zip(&self.pos)
            .all(|(target, pos)| match target {
                Some(target) => pos.distance_squared(*target) <= tolerance_squared,
                None => true,
            })
    }

    /// 骨骼求解前的方向（父 -> 子）
    #[inline]
    pub fn rest_direction(&self, parent: &[usize], i: usize) -> Vec3 {
        (self.initial_pos[i] - self.initial_pos[parent[i]])
            .try_normalize()
            .unwrap_or(Vec3::Y)
    }

    /// 根据骨骼方向的变化计算关节旋转
    ///
    /// 每根骨骼的旋转增量记在父节点上；有多个子节点时，
    /// 先统一符号再做四元数求和归一化取平均。叶子节点沿用父节点的增量。
    pub fn joint_rotations(&mut self, parent: &[usize]) {
        self.delta_sum.fill(Vec4::ZERO);
        self.delta_count.fill(0);

        for i in 1..self.len() {
            let p = parent[i];
            let before = (self.initial_pos[i] - self.initial_pos[p]).try_normalize();
            let after = (self.pos[i] - self.pos[p]).try_normalize();
            let mut delta = match (before, after) {
                (Some(before), Some(after)) => Quat::from_rotation_arc(before, after),
                _ => Quat::IDENTITY,
            };
            if delta.w < 0.0 {
                delta = -delta;
            }
            self.delta_sum[p] += Vec4::from(delta);
            self.delta_count[p] += 1;
        }

        for i in 0..self.len() {
            let delta = if self.delta_count[i] > 0 {
                averaged(self.delta_sum[i])
            } else if i > 0 {
                Quat::from_vec4(self.delta_sum[parent[i]])
            } else {
                Quat::IDENTITY
            };
            // 处理完的槽位改存最终增量，供叶子节点读取
            self.delta_sum[i] = Vec4::from(delta);
            self.rot[i] = (delta * self.initial_rot[i]).normalize();
        }
    }

    /// 把全局姿态转换回本地变换写入节点数据
    ///
    /// 岛根节点的位置由外部驱动，只回写旋转。
    pub fn store(&self, nodes: &mut [NodeData], parent: &[usize], anchor: Transform, rotations: bool) {
        for i in 1..self.len() {
            let p = parent[i];
            let inv_parent = self.rot[p].inverse();
            nodes[i].position = inv_parent * (self.pos[i] - self.pos[p]);
            if rotations {
                nodes[i].rotation = (inv_parent * self.rot[i]).normalize();
            }
        }
        if rotations {
            if let Some(base) = nodes.first_mut() {
                base.rotation = (anchor.rotation.inverse() * self.rot[0]).normalize();
            }
        }
    }
}

/// 沿父节点向上走 `chain_length` 步（0 表示走到岛根）
pub(crate) fn chain_base(parent: &[usize], tip: usize, chain_length: u16) -> usize {
    let mut node = tip;
    let mut steps = 0;
    while node != 0 && (chain_length == 0 || steps < chain_length) {
        node = parent[node];
        steps += 1;
    }
    node
}

fn averaged(sum: Vec4) -> Quat {
    match sum.try_normalize() {
        Some(v) => Quat::from_vec4(v),
        None => Quat::IDENTITY,
    }
}
