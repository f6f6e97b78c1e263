//! Dependency graph runner.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use cosched_core::{JobSet, JobState};

use crate::error::{GraphError, GraphResult};

/// A job that can never run because a prerequisite failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedJob {
    pub job: String,
    /// Nearest failed ancestor.
    pub failed_prerequisite: String,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    prereqs: Vec<usize>,
    dependents: Vec<usize>,
    state: JobState,
}

/// The job DAG, stored in topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph for a validated job set. Every job starts Pending.
    pub fn new(jobs: &JobSet) -> GraphResult<Self> {
        Self::from_prerequisites(
            jobs.iter()
                .map(|job| (job.name.clone(), job.depends_on.clone())),
        )
    }

    /// Build from `(job, prerequisites)` pairs given in definition order.
    ///
    /// Ties in the topological order are broken by definition order.
    pub fn from_prerequisites<I>(jobs: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let jobs: Vec<(String, Vec<String>)> = jobs.into_iter().collect();
        let def_index: HashMap<&str, usize> = jobs
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.as_str(), i))
            .collect();

        let mut prereqs: Vec<Vec<usize>> = Vec::with_capacity(jobs.len());
        for (_, deps) in &jobs {
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in deps {
                let &i = def_index
                    .get(dep.as_str())
                    .ok_or_else(|| GraphError::UnknownJob(dep.clone()))?;
                resolved.push(i);
            }
            prereqs.push(resolved);
        }

        let order = topological_order(&prereqs).map_err(|stuck| {
            let cycle = find_cycle(&prereqs, &stuck)
                .into_iter()
                .map(|i| jobs[i].0.clone())
                .collect();
            GraphError::InvalidDependencyGraph { cycle }
        })?;

        // Re-index nodes into topological order.
        let mut position = vec![0; jobs.len()];
        for (pos, &def) in order.iter().enumerate() {
            position[def] = pos;
        }
        let mut nodes: Vec<Node> = order
            .iter()
            .map(|&def| Node {
                name: jobs[def].0.clone(),
                prereqs: prereqs[def].iter().map(|&p| position[p]).collect(),
                dependents: Vec::new(),
                state: JobState::Pending,
            })
            .collect();
        for i in 0..nodes.len() {
            for p in nodes[i].prereqs.clone() {
                nodes[p].dependents.push(i);
            }
        }

        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        debug!(jobs = nodes.len(), "dependency graph built");
        Ok(Self { nodes, index })
    }

    /// Pending jobs whose prerequisites have all completed, in topological
    /// order.
    pub fn admissible_jobs(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.state == JobState::Pending && self.prereqs_completed(n))
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn state(&self, job: &str) -> Option<JobState> {
        self.index.get(job).map(|&i| self.nodes[i].state)
    }

    /// Position in the topological order; lower runs earlier.
    pub fn rank(&self, job: &str) -> Option<usize> {
        self.index.get(job).copied()
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn prerequisites(&self, job: &str) -> Vec<&str> {
        self.index
            .get(job)
            .map(|&i| {
                self.nodes[i]
                    .prereqs
                    .iter()
                    .map(|&p| self.nodes[p].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs in `state`, topological order.
    pub fn jobs_in(&self, state: JobState) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.state == state)
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pending → Ready. Only admissible jobs may become Ready.
    pub fn mark_ready(&mut self, job: &str) -> GraphResult<()> {
        let i = self.lookup(job)?;
        if self.nodes[i].state != JobState::Pending || !self.prereqs_completed(&self.nodes[i]) {
            return Err(self.illegal(i, JobState::Ready));
        }
        self.nodes[i].state = JobState::Ready;
        Ok(())
    }

    /// Ready or Paused → Running.
    pub fn mark_running(&mut self, job: &str) -> GraphResult<()> {
        self.transition(job, &[JobState::Ready, JobState::Paused], JobState::Running)
    }

    /// Running → Paused.
    pub fn mark_paused(&mut self, job: &str) -> GraphResult<()> {
        self.transition(job, &[JobState::Running], JobState::Paused)
    }

    /// Record a successful exit. Returns the dependents that just became
    /// admissible.
    pub fn on_job_completed(&mut self, job: &str) -> GraphResult<Vec<String>> {
        self.transition(job, &[JobState::Running, JobState::Paused], JobState::Completed)?;
        let i = self.lookup(job)?;

        let unlocked: Vec<String> = self.nodes[i]
            .dependents
            .iter()
            .map(|&d| &self.nodes[d])
            .filter(|d| d.state == JobState::Pending && self.prereqs_completed(d))
            .map(|d| d.name.clone())
            .collect();

        info!(%job, unlocked = unlocked.len(), "job completed");
        Ok(unlocked)
    }

    /// Record a failure. Returns every not-yet-finished transitive dependent,
    /// all of which are now permanently blocked.
    pub fn on_job_failed(&mut self, job: &str) -> GraphResult<Vec<String>> {
        let i = self.lookup(job)?;
        if self.nodes[i].state.is_terminal() {
            return Err(self.illegal(i, JobState::Failed));
        }
        self.nodes[i].state = JobState::Failed;

        let mut blocked = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.nodes[i].dependents.iter().copied().collect();
        while let Some(d) = queue.pop_front() {
            if !seen.insert(d) {
                continue;
            }
            if !self.nodes[d].state.is_terminal() {
                blocked.push(self.nodes[d].name.clone());
            }
            queue.extend(self.nodes[d].dependents.iter().copied());
        }
        blocked.sort_by_key(|name| self.index[name]);

        if !blocked.is_empty() {
            warn!(%job, blocked = ?blocked, "job failed; dependents blocked by failed dependency");
        } else {
            warn!(%job, "job failed");
        }
        Ok(blocked)
    }

    /// Every unfinished job that can never become Ready, with the nearest
    /// failed ancestor.
    pub fn blocked_jobs(&self) -> Vec<BlockedJob> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.state.is_terminal())
            .filter_map(|(i, n)| {
                self.nearest_failed_ancestor(i).map(|f| BlockedJob {
                    job: n.name.clone(),
                    failed_prerequisite: self.nodes[f].name.clone(),
                })
            })
            .collect()
    }

    pub fn is_blocked(&self, job: &str) -> bool {
        self.index
            .get(job)
            .is_some_and(|&i| !self.nodes[i].state.is_terminal() && self.nearest_failed_ancestor(i).is_some())
    }

    /// True once nothing is left that could still run: every job is
    /// Completed, Failed, or blocked by a failed dependency.
    pub fn is_settled(&self) -> bool {
        (0..self.nodes.len()).all(|i| {
            self.nodes[i].state.is_terminal() || self.nearest_failed_ancestor(i).is_some()
        })
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn lookup(&self, job: &str) -> GraphResult<usize> {
        self.index
            .get(job)
            .copied()
            .ok_or_else(|| GraphError::UnknownJob(job.to_string()))
    }

    fn illegal(&self, i: usize, to: JobState) -> GraphError {
        GraphError::IllegalTransition {
            job: self.nodes[i].name.clone(),
            from: self.nodes[i].state,
            to,
        }
    }

    fn transition(&mut self, job: &str, from: &[JobState], to: JobState) -> GraphResult<()> {
        let i = self.lookup(job)?;
        if !from.contains(&self.nodes[i].state) {
            return Err(self.illegal(i, to));
        }
        self.nodes[i].state = to;
        Ok(())
    }

    fn prereqs_completed(&self, node: &Node) -> bool {
        node.prereqs
            .iter()
            .all(|&p| self.nodes[p].state == JobState::Completed)
    }

    fn nearest_failed_ancestor(&self, i: usize) -> Option<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.nodes[i].prereqs.iter().copied().collect();
        while let Some(p) = queue.pop_front() {
            if !seen.insert(p) {
                continue;
            }
            if self.nodes[p].state == JobState::Failed {
                return Some(p);
            }
            queue.extend(self.nodes[p].prereqs.iter().copied());
        }
        None
    }
}

/// Kahn's algorithm over definition indices, lowest index first among
/// ready nodes. On a cycle, returns the nodes that never reached in-degree
/// zero.
fn topological_order(prereqs: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = prereqs.len();
    let mut indegree: Vec<usize> = prereqs.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); n];
    for (i, deps) in prereqs.iter().enumerate() {
        for &p in deps {
            dependents[p].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| indegree[i] > 0).collect())
    }
}

/// Walk prerequisite edges among `stuck` nodes until one repeats; the
/// repeated suffix is a cycle.
fn find_cycle(prereqs: &[Vec<usize>], stuck: &[usize]) -> Vec<usize> {
    let stuck_set: HashSet<usize> = stuck.iter().copied().collect();
    let Some(&start) = stuck.first() else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut on_path = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&pos) = on_path.get(&current) {
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            cycle.push(current);
            return cycle;
        }
        on_path.insert(current, path.len());
        path.push(current);
        // Every stuck node has at least one stuck prerequisite.
        match prereqs[current].iter().find(|p| stuck_set.contains(p)) {
            Some(&next) => current = next,
            None => return path,
        }
    }
}
