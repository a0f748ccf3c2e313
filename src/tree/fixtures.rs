//! 单元测试用的节点树

use glam::Vec3;

use super::{Effector, Guid, NodeId, NodeTree};

/// 根据 (父, 子) 边建树，每个子节点相对父节点偏移 +Y 一个单位
pub fn build(edges: &[(Guid, Guid)]) -> NodeTree {
    let root_guid = edges.first().map(|(parent, _)| *parent).unwrap_or(0);
    let mut tree = NodeTree::new(root_guid);
    for (parent, child) in edges {
        let parent = tree.find(*parent).unwrap();
        let id = tree.create_child(parent, *child).unwrap();
        tree.set_position(id, Vec3::Y).unwrap();
    }
    tree
}

pub fn node(tree: &NodeTree, guid: Guid) -> NodeId {
    tree.find(guid).unwrap()
}

pub fn attach(tree: &mut NodeTree, guid: Guid, chain_length: u16) {
    let id = node(tree, guid);
    tree.attach_effector(id, Effector::default().with_chain_length(chain_length))
        .unwrap();
}

/// 0 - 1 - ... - (n-1) 的直链
pub fn chain(n: u32) -> NodeTree {
    let edges: Vec<(Guid, Guid)> = (1..n).map(|i| (i - 1, i)).collect();
    build(&edges)
}

///            0
///            |
///            1
///            |
///            2
///           / \
///          3   5
///         /     \
///        4       6
///               / \
///              7   8
///                   \
///                    9 - 10 - 11 - 12
///
/// 效应器：4（链长 1）、7（链长 4）、11（链长 7）
pub fn weird_tree() -> NodeTree {
    let mut tree = build(&[
        (0, 1),
        (1, 2),
        (2, 3),
        (3, 4),
        (2, 5),
        (5, 6),
        (6, 7),
        (6, 8),
        (8, 9),
        (9, 10),
        (10, 11),
        (11, 12),
    ]);
    attach(&mut tree, 4, 1);
    attach(&mut tree, 7, 4);
    attach(&mut tree, 11, 7);
    tree
}

/// 0 - 1 - 2 - 3 - 4 与 2 - 5 - 6 两条手臂在 2 汇合，两个效应器链长都是 2
pub fn two_arms_meet() -> NodeTree {
    let mut tree = build(&[(0, 1), (1, 2), (2, 3), (3, 4), (2, 5), (5, 6)]);
    attach(&mut tree, 4, 2);
    attach(&mut tree, 6, 2);
    tree
}

/// 0 - ... - 6 直链，效应器在 3 和 6，链长都不限
pub fn effector_in_middle() -> NodeTree {
    let mut tree = chain(7);
    attach(&mut tree, 3, 0);
    attach(&mut tree, 6, 0);
    tree
}

/// 0 - ... - 6 与 3 - 7 - 8 - 9，效应器在 6 和 9，链长都不限
pub fn two_effectors() -> NodeTree {
    let mut tree = build(&[
        (0, 1),
        (1, 2),
        (2, 3),
        (3, 4),
        (4, 5),
        (5, 6),
        (3, 7),
        (7, 8),
        (8, 9),
    ]);
    attach(&mut tree, 6, 0);
    attach(&mut tree, 9, 0);
    tree
}
