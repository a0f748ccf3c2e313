//! Graphviz 调试输出
//!
//! 输出原始节点树的所有边，效应器节点着色，每个岛的链用彩色粗线叠加。
//! 只用于可视化，不属于求解流程。

use std::io::Write;

use crate::solver::{Chain, Island};
use crate::tree::NodeTree;
use crate::Result;

const EFFECTOR_COLOR: &str = "0.6 0.5 1.0";
const POLE_COLOR: &str = "0.3 0.5 1.0";
const CHAIN_COLOR: &str = "1.0 0.5 1.0";

/// 写出 `graph` 格式的调试图
pub fn write_dot<W: Write>(tree: &NodeTree, islands: &[Island], writer: &mut W) -> Result<()> {
    writeln!(writer, "graph chain_tree {{")?;

    for id in tree.pre_order() {
        let Some(guid) = tree.guid(id) else { continue };
        let (has_effector, has_pole) =
            tree.with_data(id, |data| (data.effector.is_some(), data.pole.is_some()))?;
        if has_effector {
            writeln!(writer, "    n{guid} [label=\"{guid}\", color=\"{EFFECTOR_COLOR}\"];")?;
        } else if has_pole {
            writeln!(writer, "    n{guid} [label=\"{guid}\", color=\"{POLE_COLOR}\"];")?;
        } else {
            writeln!(writer, "    n{guid} [label=\"{guid}\"];")?;
        }

        for &child in tree.children(id) {
            if let Some(child_guid) = tree.guid(child) {
                writeln!(writer, "    n{guid} -- n{child_guid};")?;
            }
        }
    }

    for island in islands {
        for chain in island.chains() {
            write_chain(&chain, writer)?;
        }
    }

    writeln!(writer, "}}")?;
    Ok(())
}

fn write_chain<W: Write>(chain: &Chain, writer: &mut W) -> Result<()> {
    if let (Some(tip), Some(base)) = (chain.tip(), chain.base()) {
        writeln!(writer, "    n{tip} [shape=record];")?;
        writeln!(writer, "    n{base} [shape=record];")?;
    }
    for pair in chain.nodes.windows(2) {
        writeln!(
            writer,
            "    n{} -- n{} [color=\"{CHAIN_COLOR}\", penwidth=3];",
            pair[0], pair[1]
        )?;
    }
    for child in &chain.children {
        write_chain(child, writer)?;
    }
    Ok(())
}
