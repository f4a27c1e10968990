use std::collections::BTreeSet;

use crate::errors::AnalysisError;
use crate::ir::MethodIr;

/// Per-instruction successor lists plus the set of edges that are only
/// taken exceptionally.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlFlowGraph {
    pub transitions: Vec<Vec<usize>>,
    pub exceptional: BTreeSet<(usize, usize)>,
}

impl ControlFlowGraph {
    /// Decode successor edges from the typed instruction list and the
    /// handler table. Fallthrough successors come first so analyses visit
    /// the straight-line path before jump targets.
    pub fn build(method: &MethodIr) -> Result<ControlFlowGraph, AnalysisError> {
        let count = method.instructions.len();
        let mut transitions = Vec::with_capacity(count);
        let mut exceptional = BTreeSet::new();

        for (index, insn) in method.instructions.iter().enumerate() {
            let mut successors = Vec::new();
            if insn.falls_through() {
                if index + 1 >= count {
                    return Err(AnalysisError::Malformed(format!(
                        "execution falls off the end at instruction {index}"
                    )));
                }
                successors.push(index + 1);
            }
            for target in insn.jump_targets() {
                if target >= count {
                    return Err(AnalysisError::Malformed(format!(
                        "branch target {target} out of range at instruction {index}"
                    )));
                }
                if !successors.contains(&target) {
                    successors.push(target);
                }
            }
            transitions.push(successors);
        }

        for handler in &method.handlers {
            if handler.handler >= count || handler.end > count {
                return Err(AnalysisError::Malformed(format!(
                    "exception handler out of range: {handler:?}"
                )));
            }
            for index in handler.start..handler.end {
                if !transitions[index].contains(&handler.handler) {
                    transitions[index].push(handler.handler);
                }
                exceptional.insert((index, handler.handler));
            }
        }

        Ok(ControlFlowGraph {
            transitions,
            exceptional,
        })
    }

    pub fn instruction_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn successors(&self, index: usize) -> &[usize] {
        &self.transitions[index]
    }

    pub fn is_exceptional(&self, from: usize, to: usize) -> bool {
        self.exceptional.contains(&(from, to))
    }

    /// Whether any instruction has more than one successor.
    pub fn branching(&self) -> bool {
        self.transitions.iter().any(|successors| successors.len() > 1)
    }
}

/// DFS spanning tree with preorder/postorder numbering and edge
/// classification. Built iteratively; method bodies can be adversarially
/// deep, so no native recursion.
#[derive(Clone, Debug)]
pub struct DfsTree {
    pre: Vec<u32>,
    post: Vec<u32>,
    pub loop_enters: Vec<bool>,
    pub back: BTreeSet<(usize, usize)>,
    pub non_back: Vec<(usize, usize)>,
}

impl DfsTree {
    pub fn build(graph: &ControlFlowGraph) -> DfsTree {
        let count = graph.instruction_count();
        let mut pre = vec![0u32; count];
        let mut post = vec![0u32; count];
        let mut marked = vec![false; count];
        let mut scanned = vec![false; count];
        let mut loop_enters = vec![false; count];
        let mut back = BTreeSet::new();
        let mut non_back = Vec::new();

        if count == 0 {
            return DfsTree {
                pre,
                post,
                loop_enters,
                back,
                non_back,
            };
        }

        let mut pre_counter = 0u32;
        let mut post_counter = 0u32;
        let mut stack: Vec<(usize, usize)> = Vec::with_capacity(count);

        marked[0] = true;
        pre_counter += 1;
        pre[0] = pre_counter;
        stack.push((0, 0));

        while let Some(&mut (node, ref mut cursor)) = stack.last_mut() {
            let successors = graph.successors(node);
            if *cursor < successors.len() {
                let target = successors[*cursor];
                *cursor += 1;
                if !marked[target] {
                    marked[target] = true;
                    pre_counter += 1;
                    pre[target] = pre_counter;
                    non_back.push((node, target));
                    stack.push((target, 0));
                } else if pre[target] > pre[node] {
                    non_back.push((node, target));
                } else if !scanned[target] {
                    back.insert((node, target));
                    loop_enters[target] = true;
                } else {
                    non_back.push((node, target));
                }
            } else {
                stack.pop();
                post_counter += 1;
                post[node] = post_counter;
                scanned[node] = true;
            }
        }

        DfsTree {
            pre,
            post,
            loop_enters,
            back,
            non_back,
        }
    }

    pub fn is_reachable(&self, node: usize) -> bool {
        self.pre.get(node).copied().unwrap_or(0) != 0
    }

    /// Preorder/postorder bracketing test for tree ancestry.
    pub fn is_descendant(&self, child: usize, parent: usize) -> bool {
        self.is_reachable(child)
            && self.is_reachable(parent)
            && self.pre[parent] <= self.pre[child]
            && self.post[child] <= self.post[parent]
    }

    pub fn pre_order(&self, node: usize) -> u32 {
        self.pre[node]
    }
}

/// CFG plus its DFS tree and the reducibility verdict.
#[derive(Clone, Debug)]
pub struct RichControlFlow {
    pub graph: ControlFlowGraph,
    pub dfs: DfsTree,
    reducible: bool,
}

impl RichControlFlow {
    pub fn new(graph: ControlFlowGraph) -> RichControlFlow {
        let dfs = DfsTree::build(&graph);
        let reducible = reducible(&graph, &dfs);
        RichControlFlow {
            graph,
            dfs,
            reducible,
        }
    }

    pub fn reducible(&self) -> bool {
        self.reducible
    }
}

/// Tarjan's reducibility test: collapse loop bodies header by header in
/// reverse preorder; the graph is reducible iff every node reaching a
/// cycle through a non-back edge is a DFS descendant of that cycle's
/// header. Graphs with no back edges are reducible on the fast path.
pub fn reducible(graph: &ControlFlowGraph, dfs: &DfsTree) -> bool {
    if dfs.back.is_empty() {
        return true;
    }
    let count = graph.instruction_count();
    let mut cycle_incoming: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
    for &(from, to) in &dfs.back {
        cycle_incoming[to].insert(from);
    }
    let mut non_cycle_incoming: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(from, to) in &dfs.non_back {
        non_cycle_incoming[to].push(from);
    }
    let mut collapsed_to: Vec<usize> = (0..count).collect();

    let mut headers: Vec<usize> = (0..count).filter(|&node| dfs.loop_enters[node]).collect();
    headers.sort_by_key(|&header| std::cmp::Reverse(dfs.pre_order(header)));

    for header in headers {
        let mut body = std::mem::take(&mut cycle_incoming[header]);
        let mut queue: Vec<usize> = body
            .iter()
            .map(|&from| collapsed_to[from])
            .filter(|&node| node != header)
            .collect();
        body.extend(queue.iter().copied());

        while let Some(node) = queue.pop() {
            for index in 0..non_cycle_incoming[node].len() {
                let predecessor = collapsed_to[non_cycle_incoming[node][index]];
                if !dfs.is_descendant(predecessor, header) {
                    return false;
                }
                if predecessor != header && body.insert(predecessor) {
                    queue.push(predecessor);
                }
            }
        }

        for node in body {
            collapsed_to[node] = header;
        }
    }
    true
}
