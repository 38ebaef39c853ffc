//! The execution plan: tracks which edges the requested targets need run
//! and serves the ones whose generated inputs are all up to date.

use crate::dirty::DependencyScan;
use crate::fs::MTime;
use crate::graph::{EdgeId, EdgeState, Graph, NodeId};
use anyhow::{anyhow, bail};
use std::collections::VecDeque;

/// Per-invocation scheduling state.  Edges move Unknown -> Want -> Ready ->
/// Running -> Finished/Failed; membership here mirrors the state stored on
/// each edge.
#[derive(Default)]
pub struct Plan {
    /// Edges ready to run, served in the order they became ready.
    ready: VecDeque<EdgeId>,
    /// Count of edges in Want state, still blocked on generated inputs.
    n_want: usize,
    n_running: usize,
    n_failed: usize,
}

impl Plan {
    pub fn new() -> Self {
        Plan::default()
    }

    /// Enlist whatever must run to bring a target up to date.  A clean
    /// target enlists nothing and succeeds.
    pub fn add_target(&mut self, graph: &mut Graph, path: &str) -> anyhow::Result<()> {
        let id = graph
            .lookup_node(path)
            .ok_or_else(|| anyhow!("unknown target '{}'", path))?;
        self.add_target_node(graph, id)
    }

    pub fn add_target_node(&mut self, graph: &mut Graph, id: NodeId) -> anyhow::Result<()> {
        if !graph.node(id).dirty() {
            return Ok(());
        }
        let edge = match graph.node(id).in_edge {
            Some(edge) => edge,
            None => bail!(
                "'{}' missing and no known rule to make it",
                graph.node(id).path
            ),
        };
        self.want_edge(graph, edge);
        Ok(())
    }

    /// Want an edge and, transitively, the producers of its dirty inputs.
    fn want_edge(&mut self, graph: &mut Graph, id: EdgeId) {
        if graph.edge(id).state != EdgeState::Unknown {
            return;
        }
        graph.edge_mut(id).state = EdgeState::Want;
        self.n_want += 1;
        let ins: Vec<NodeId> = graph.edge(id).all_ins().collect();
        for input in ins {
            if !graph.node(input).dirty() {
                continue;
            }
            if let Some(producer) = graph.node(input).in_edge {
                self.want_edge(graph, producer);
            }
        }
        self.maybe_ready(graph, id);
    }

    /// Whether every input that has a producer has seen that producer
    /// finish.  Source inputs never gate readiness; a missing one will
    /// fail the command instead.
    fn edge_ready(graph: &Graph, id: EdgeId) -> bool {
        graph.edge(id).all_ins().all(|input| {
            match graph.node(input).in_edge {
                None => true,
                Some(producer) => !matches!(
                    graph.edge(producer).state,
                    EdgeState::Want | EdgeState::Ready | EdgeState::Running | EdgeState::Failed
                ),
            }
        })
    }

    fn maybe_ready(&mut self, graph: &mut Graph, id: EdgeId) {
        if graph.edge(id).state != EdgeState::Want {
            return;
        }
        if !Self::edge_ready(graph, id) {
            return;
        }
        graph.edge_mut(id).state = EdgeState::Ready;
        self.n_want -= 1;
        self.ready.push_back(id);
    }

    /// Hand out a ready edge, if any.  Never blocks.
    pub fn find_work(&mut self, graph: &mut Graph) -> Option<EdgeId> {
        let id = self.ready.pop_front()?;
        graph.edge_mut(id).state = EdgeState::Running;
        self.n_running += 1;
        Some(id)
    }

    /// Absorb an edge's result.  On success the outputs' cached mtimes are
    /// refreshed from disk; a restat rule that left an output untouched
    /// instead stores `restat_mtime` and lets downstream edges that only
    /// depended on the timestamp be skipped outright.
    pub fn edge_finished(
        &mut self,
        graph: &mut Graph,
        scan: &mut DependencyScan,
        id: EdgeId,
        success: bool,
        restat_mtime: MTime,
    ) {
        self.n_running -= 1;
        if !success {
            graph.edge_mut(id).state = EdgeState::Failed;
            self.n_failed += 1;
            // Downstream edges stay wanted and unready; siblings keep
            // getting served until the ready queue drains.
            return;
        }
        graph.edge_mut(id).state = EdgeState::Finished;

        let restat = graph.rule(graph.edge(id).rule).restat;
        for out in graph.edge(id).outs.clone() {
            let before = scan.cache.get(out);
            let after = scan.disk_mtime(graph, out);
            graph.set_dirty(out, false);
            if restat && before == Some(after) {
                // Untouched output: short-circuit downstream while the
                // cache still holds the on-disk stamps, then account the
                // command's effective time.
                self.clean_node(graph, scan, out);
                scan.cache.set(out, restat_mtime);
            } else {
                scan.cache.set(out, after);
            }
        }

        self.ready_dependents(graph, id);
    }

    /// A restat output came back unchanged: any wanted-but-unready edge
    /// over it that now passes the output checks is finished without
    /// running, recursively.
    fn clean_node(&mut self, graph: &mut Graph, scan: &mut DependencyScan, id: NodeId) {
        for eid in graph.node(id).out_edges.clone() {
            if graph.edge(eid).state != EdgeState::Want {
                continue;
            }
            if graph.edge(eid).dirtying_ins().any(|n| graph.node(n).dirty()) {
                continue;
            }
            if scan.outputs_dirty(graph, eid) {
                continue;
            }
            graph.edge_mut(eid).state = EdgeState::Finished;
            self.n_want -= 1;
            for out in graph.edge(eid).outs.clone() {
                graph.set_dirty(out, false);
                self.clean_node(graph, scan, out);
            }
            self.ready_dependents(graph, eid);
        }
    }

    fn ready_dependents(&mut self, graph: &mut Graph, id: EdgeId) {
        for out in graph.edge(id).outs.clone() {
            for eid in graph.node(out).out_edges.clone() {
                self.maybe_ready(graph, eid);
            }
        }
    }

    /// Edges enlisted but not yet finished or failed.
    pub fn pending(&self) -> usize {
        self.n_want + self.ready.len()
    }

    pub fn running(&self) -> usize {
        self.n_running
    }

    pub fn failed(&self) -> usize {
        self.n_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_log::BuildLog;
    use crate::fs::{FileSystem, StatCache};
    use crate::graph::{InOut, Rule};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeFs {
        mtimes: HashMap<String, u64>,
    }
    impl FakeFs {
        fn add(&mut self, path: &str, mtime: u64) {
            self.mtimes.insert(path.to_owned(), mtime);
        }
    }
    impl FileSystem for FakeFs {
        fn stat(&self, path: &str) -> std::io::Result<MTime> {
            Ok(self
                .mtimes
                .get(path)
                .map(|&t| MTime::Stamp(t))
                .unwrap_or(MTime::Missing))
        }
    }

    fn cat_graph() -> (Graph, EdgeId) {
        let mut graph = Graph::new();
        let rule = graph
            .add_rule(Rule::new("cat", "cat $in > $out").unwrap())
            .unwrap();
        let edge = graph.add_edge(rule);
        graph.add_in_out(edge, InOut::In, "in1").unwrap();
        graph.add_in_out(edge, InOut::In, "in2").unwrap();
        graph.add_in_out(edge, InOut::Out, "out").unwrap();
        (graph, edge)
    }

    #[test]
    fn basic() {
        // The canonical scenario: touch one input, plan the output, get the
        // edge exactly once.
        let (mut graph, edge) = cat_graph();
        assert_eq!(graph.evaluate_command(edge, false), "cat in1 in2 > out");

        assert!(!graph.node(graph.lookup_node("in1").unwrap()).dirty());
        assert!(!graph.node(graph.lookup_node("in2").unwrap()).dirty());
        assert!(!graph.node(graph.lookup_node("out").unwrap()).dirty());

        let mut cache = StatCache::new();
        cache.touch(&mut graph, "in1", 1);
        assert!(graph.node(graph.lookup_node("in1").unwrap()).dirty());
        assert!(!graph.node(graph.lookup_node("in2").unwrap()).dirty());
        assert!(graph.node(graph.lookup_node("out").unwrap()).dirty());

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out").unwrap();
        assert_eq!(plan.find_work(&mut graph), Some(edge));
        assert_eq!(plan.find_work(&mut graph), None);
    }

    #[test]
    fn clean_target_enlists_nothing() {
        let (mut graph, _edge) = cat_graph();
        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out").unwrap();
        assert_eq!(plan.pending(), 0);
        assert_eq!(plan.find_work(&mut graph), None);
    }

    #[test]
    fn unknown_target() {
        let (mut graph, _edge) = cat_graph();
        let mut plan = Plan::new();
        let err = plan.add_target(&mut graph, "nonesuch").unwrap_err();
        assert!(err.to_string().contains("unknown target"));
    }

    #[test]
    fn missing_source_has_no_producer() {
        let mut graph = Graph::new();
        graph.get_node("lonely.c");
        let fs = FakeFs::default();
        let log = BuildLog::new();
        let mut cache = StatCache::new();
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        let id = graph.lookup_node("lonely.c").unwrap();
        assert!(scan.recompute_dirty(&mut graph, id));

        let mut plan = Plan::new();
        let err = plan.add_target(&mut graph, "lonely.c").unwrap_err();
        assert!(err.to_string().contains("no known rule to make it"));
    }

    #[test]
    fn zero_input_edge_is_ready_immediately() {
        let mut graph = Graph::new();
        let rule = graph
            .add_rule(Rule::new("touch", "touch $out").unwrap())
            .unwrap();
        let edge = graph.add_edge(rule);
        graph.add_in_out(edge, InOut::Out, "out").unwrap();
        let out = graph.lookup_node("out").unwrap();
        graph.mark_dirty(out);

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out").unwrap();
        assert_eq!(plan.find_work(&mut graph), Some(edge));
    }

    /// in -> mid -> out, both generated, everything missing on disk.
    fn chain_graph() -> (Graph, EdgeId, EdgeId) {
        let mut graph = Graph::new();
        let rule = graph
            .add_rule(Rule::new("copy", "cp $in $out").unwrap())
            .unwrap();
        let first = graph.add_edge(rule);
        graph.add_in_out(first, InOut::In, "in").unwrap();
        graph.add_in_out(first, InOut::Out, "mid").unwrap();
        let second = graph.add_edge(rule);
        graph.add_in_out(second, InOut::In, "mid").unwrap();
        graph.add_in_out(second, InOut::Out, "out").unwrap();
        (graph, first, second)
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let (mut graph, first, second) = chain_graph();
        let mut fs = FakeFs::default();
        fs.add("in", 1);
        let log = BuildLog::new();
        let mut cache = StatCache::new();
        {
            let mut scan = DependencyScan::new(&fs, &mut cache, &log);
            let out = graph.lookup_node("out").unwrap();
            assert!(scan.recompute_dirty(&mut graph, out));
        }

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out").unwrap();
        assert_eq!(plan.find_work(&mut graph), Some(first));
        // The second edge waits on mid.
        assert_eq!(plan.find_work(&mut graph), None);

        // "Run" the first edge.
        fs.add("mid", 2);
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        plan.edge_finished(&mut graph, &mut scan, first, true, MTime::Missing);
        assert_eq!(plan.find_work(&mut graph), Some(second));

        fs.add("out", 3);
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        plan.edge_finished(&mut graph, &mut scan, second, true, MTime::Missing);
        assert_eq!(plan.pending(), 0);
        assert_eq!(plan.running(), 0);
    }

    #[test]
    fn failure_strands_dependents() {
        let (mut graph, first, second) = chain_graph();
        let mut fs = FakeFs::default();
        fs.add("in", 1);
        let log = BuildLog::new();
        let mut cache = StatCache::new();
        {
            let mut scan = DependencyScan::new(&fs, &mut cache, &log);
            let out = graph.lookup_node("out").unwrap();
            scan.recompute_dirty(&mut graph, out);
        }

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out").unwrap();
        assert_eq!(plan.find_work(&mut graph), Some(first));
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        plan.edge_finished(&mut graph, &mut scan, first, false, MTime::Missing);
        assert_eq!(plan.find_work(&mut graph), None);
        assert_eq!(plan.failed(), 1);
        assert_eq!(graph.edge(second).state, EdgeState::Want);
        assert!(plan.pending() > 0);
    }

    #[test]
    fn failure_keeps_serving_siblings() {
        let mut graph = Graph::new();
        let rule = graph
            .add_rule(Rule::new("touch", "touch $out").unwrap())
            .unwrap();
        let a = graph.add_edge(rule);
        graph.add_in_out(a, InOut::Out, "a").unwrap();
        let b = graph.add_edge(rule);
        graph.add_in_out(b, InOut::Out, "b").unwrap();

        let fs = FakeFs::default();
        let log = BuildLog::new();
        let mut cache = StatCache::new();
        {
            let mut scan = DependencyScan::new(&fs, &mut cache, &log);
            for path in ["a", "b"] {
                let id = graph.lookup_node(path).unwrap();
                scan.recompute_dirty(&mut graph, id);
            }
        }

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "a").unwrap();
        plan.add_target(&mut graph, "b").unwrap();
        let first = plan.find_work(&mut graph).unwrap();
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        plan.edge_finished(&mut graph, &mut scan, first, false, MTime::Missing);
        // The unrelated edge still gets served.
        assert!(plan.find_work(&mut graph).is_some());
    }

    #[test]
    fn restat_cutoff_skips_downstream() {
        // in -> mid (restat) -> out2.  The input is newer so the restat
        // edge reruns, but its command leaves mid alone; the downstream
        // edge is finished without running.
        let mut graph = Graph::new();
        let mut gen = Rule::new("gen", "gen $in > $out").unwrap();
        gen.restat = true;
        let gen = graph.add_rule(gen).unwrap();
        let cat = graph
            .add_rule(Rule::new("cat", "cat $in > $out").unwrap())
            .unwrap();
        let first = graph.add_edge(gen);
        graph.add_in_out(first, InOut::In, "in").unwrap();
        graph.add_in_out(first, InOut::Out, "mid").unwrap();
        let second = graph.add_edge(cat);
        graph.add_in_out(second, InOut::In, "mid").unwrap();
        graph.add_in_out(second, InOut::Out, "out2").unwrap();

        let mut log = BuildLog::new();
        log.record(&graph, first, 0, 1, MTime::Missing).unwrap();
        log.record(&graph, second, 1, 2, MTime::Missing).unwrap();

        let mut fs = FakeFs::default();
        fs.add("in", 10);
        fs.add("mid", 5);
        fs.add("out2", 6);

        let mut cache = StatCache::new();
        {
            let mut scan = DependencyScan::new(&fs, &mut cache, &log);
            let out2 = graph.lookup_node("out2").unwrap();
            assert!(scan.recompute_dirty(&mut graph, out2));
        }

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out2").unwrap();
        assert_eq!(plan.find_work(&mut graph), Some(first));

        // The command ran but did not touch mid; the driver reports the
        // newest input mtime as the restat mtime.
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        plan.edge_finished(&mut graph, &mut scan, first, true, MTime::Stamp(10));

        assert_eq!(graph.edge(second).state, EdgeState::Finished);
        assert!(!graph.node(graph.lookup_node("out2").unwrap()).dirty());
        assert_eq!(plan.find_work(&mut graph), None);
        assert_eq!(plan.pending(), 0);
    }

    #[test]
    fn restat_touched_output_still_runs_downstream() {
        let mut graph = Graph::new();
        let mut gen = Rule::new("gen", "gen $in > $out").unwrap();
        gen.restat = true;
        let gen = graph.add_rule(gen).unwrap();
        let cat = graph
            .add_rule(Rule::new("cat", "cat $in > $out").unwrap())
            .unwrap();
        let first = graph.add_edge(gen);
        graph.add_in_out(first, InOut::In, "in").unwrap();
        graph.add_in_out(first, InOut::Out, "mid").unwrap();
        let second = graph.add_edge(cat);
        graph.add_in_out(second, InOut::In, "mid").unwrap();
        graph.add_in_out(second, InOut::Out, "out2").unwrap();

        let mut fs = FakeFs::default();
        fs.add("in", 10);
        fs.add("mid", 5);
        fs.add("out2", 6);

        let log = BuildLog::new();
        let mut cache = StatCache::new();
        {
            let mut scan = DependencyScan::new(&fs, &mut cache, &log);
            let out2 = graph.lookup_node("out2").unwrap();
            scan.recompute_dirty(&mut graph, out2);
        }

        let mut plan = Plan::new();
        plan.add_target(&mut graph, "out2").unwrap();
        assert_eq!(plan.find_work(&mut graph), Some(first));

        // This time the command rewrote mid.
        fs.add("mid", 11);
        let mut scan = DependencyScan::new(&fs, &mut cache, &log);
        plan.edge_finished(&mut graph, &mut scan, first, true, MTime::Stamp(10));
        assert_eq!(plan.find_work(&mut graph), Some(second));
    }
}
