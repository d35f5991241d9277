//! Dependency resolution: fragment discovery and execution ordering.
//!
//! Starting from the requested entries, a breadth-first traversal
//! instantiates every reachable fragment kind exactly once per module
//! build, collecting any self-test entries fragments expose along the way;
//! each newly discovered test becomes one more entry to process. Ordering
//! assigns each instance a height, one more than the tallest of its
//! dependencies, and sorts by height with ties broken by first-discovery
//! order. Anything that depends on itself, directly or transitively, is
//! rejected here, before a single statement is emitted.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::AsmError;
use crate::fragment::{Entry, EntryHandle, Fragment, FragmentHandle, FragmentKind};

/// Everything the assembler needs to drive one build.
pub struct Resolved {
    /// Fragment instances, in first-discovery order.
    pub fragments: Vec<Box<dyn Fragment>>,
    /// Indices into `fragments`, sorted by dependency height.
    pub global_order: Vec<usize>,
    /// Entry instances: the requested entries, then discovered tests, in
    /// discovery order.
    pub entries: Vec<Box<dyn Entry>>,
    /// Per entry: indices of the fragments reachable from it, sorted by
    /// dependency height. Parallel to `entries`.
    pub entry_deps: Vec<Vec<usize>>,
    /// Indices into `entries` that are self-tests.
    pub tests: Vec<usize>,
}

impl Resolved {
    pub fn kind_of(&self, idx: usize) -> FragmentKind {
        self.fragments[idx].kind()
    }
}

pub fn resolve(requested: &[EntryHandle], build_tests: bool) -> Result<Resolved, AsmError> {
    let mut fragments: Vec<Box<dyn Fragment>> = Vec::new();
    let mut kind_index: HashMap<FragmentKind, usize> = HashMap::new();

    let mut entries: Vec<Box<dyn Entry>> = Vec::new();
    let mut entry_reachable: Vec<Vec<usize>> = Vec::new();
    let mut tests: Vec<usize> = Vec::new();

    let mut entry_queue: VecDeque<(EntryHandle, bool)> = VecDeque::new();
    let mut entry_kinds: HashSet<FragmentKind> = HashSet::new();
    for handle in requested {
        if entry_kinds.insert(handle.kind.clone()) {
            entry_queue.push_back((handle.clone(), false));
        }
    }

    while let Some((handle, is_test)) = entry_queue.pop_front() {
        let entry = (handle.build)();
        let mut frag_queue: VecDeque<FragmentHandle> = entry.deps().into();
        if build_tests {
            for test in entry.tests() {
                if entry_kinds.insert(test.kind.clone()) {
                    entry_queue.push_back((test, true));
                }
            }
        }

        let mut seen: HashSet<FragmentKind> = HashSet::new();
        let mut reachable: Vec<usize> = Vec::new();
        while let Some(dep) = frag_queue.pop_front() {
            if !seen.insert(dep.kind.clone()) {
                continue;
            }
            let idx = match kind_index.get(&dep.kind) {
                Some(&idx) => idx,
                None => {
                    let idx = fragments.len();
                    fragments.push((dep.build)());
                    kind_index.insert(dep.kind.clone(), idx);
                    idx
                }
            };
            reachable.push(idx);
            for sub in fragments[idx].deps() {
                if !seen.contains(&sub.kind) {
                    frag_queue.push_back(sub);
                }
            }
            if build_tests {
                for test in fragments[idx].tests() {
                    if entry_kinds.insert(test.kind.clone()) {
                        entry_queue.push_back((test, true));
                    }
                }
            }
        }

        if is_test {
            tests.push(entries.len());
        }
        entries.push(entry);
        entry_reachable.push(reachable);
    }

    let heights = heights(&fragments, &kind_index)?;

    let mut global_order: Vec<usize> = (0..fragments.len()).collect();
    global_order.sort_by_key(|&i| (heights[i], i));

    let entry_deps = entry_reachable
        .into_iter()
        .map(|mut reachable| {
            reachable.sort_by_key(|&i| (heights[i], i));
            reachable
        })
        .collect();

    Ok(Resolved {
        fragments,
        global_order,
        entries,
        entry_deps,
        tests,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done(u32),
}

/// `height[f] = 1 + max(height[dep])`, failing on any cycle.
fn heights(
    fragments: &[Box<dyn Fragment>],
    kind_index: &HashMap<FragmentKind, usize>,
) -> Result<Vec<u32>, AsmError> {
    fn walk(
        idx: usize,
        fragments: &[Box<dyn Fragment>],
        kind_index: &HashMap<FragmentKind, usize>,
        state: &mut HashMap<usize, Visit>,
    ) -> Result<u32, AsmError> {
        match state.get(&idx) {
            Some(Visit::Done(h)) => return Ok(*h),
            Some(Visit::InProgress) => {
                return Err(AsmError::DependencyCycle(fragments[idx].kind().to_string()))
            }
            None => {}
        }
        state.insert(idx, Visit::InProgress);
        let mut height = 0;
        for dep in fragments[idx].deps() {
            let dep_idx = kind_index[&dep.kind];
            height = height.max(walk(dep_idx, fragments, kind_index, state)?);
        }
        let height = height + 1;
        state.insert(idx, Visit::Done(height));
        Ok(height)
    }

    let mut state = HashMap::new();
    let mut out = Vec::with_capacity(fragments.len());
    for idx in 0..fragments.len() {
        out.push(walk(idx, fragments, kind_index, &mut state)?);
    }
    Ok(out)
}
