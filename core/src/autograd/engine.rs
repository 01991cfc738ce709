use super::{GraphNode, Result};
use std::collections::HashSet;
use std::rc::Rc;

/// Runs every node reachable from `root` in reverse topological order.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    let mut topo = Vec::new();
    let mut visited = HashSet::new();
    build_topo(root, &mut topo, &mut visited);

    for node in topo.into_iter().rev() {
        node.backward()?;
    }
    Ok(())
}

fn build_topo(
    node: Rc<dyn GraphNode>,
    topo: &mut Vec<Rc<dyn GraphNode>>,
    visited: &mut HashSet<*const ()>,
) {
    // the data pointer of an `Rc<dyn _>` identifies the node
    let ptr = Rc::as_ptr(&node) as *const ();
    if !visited.insert(ptr) {
        return;
    }

    for parent in node.parents() {
        build_topo(parent, topo, visited);
    }

    topo.push(node);
}
