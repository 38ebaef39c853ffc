//! Dirtiness scanning: decides which files and edges are out of date by
//! walking the graph, comparing mtimes and consulting the build log.

use crate::build_log::BuildLog;
use crate::fs::{FileSystem, MTime, StatCache};
use crate::graph::{EdgeId, Graph, NodeId};

/// The context a dirtiness decision needs: the filesystem, the
/// per-invocation stat cache, and the previous build's log.
pub struct DependencyScan<'a> {
    fs: &'a dyn FileSystem,
    pub cache: &'a mut StatCache,
    pub log: &'a BuildLog,
}

impl<'a> DependencyScan<'a> {
    pub fn new(fs: &'a dyn FileSystem, cache: &'a mut StatCache, log: &'a BuildLog) -> Self {
        DependencyScan { fs, cache, log }
    }

    /// The node's mtime, memoized for the whole invocation.
    pub fn stat(&mut self, graph: &Graph, id: NodeId) -> MTime {
        self.cache.stat(self.fs, graph, id)
    }

    /// A fresh stat bypassing the cache, for re-reading outputs after an
    /// edge ran.  The caller decides what to store back in the cache.
    pub fn disk_mtime(&self, graph: &Graph, id: NodeId) -> MTime {
        let path = &graph.node(id).path;
        match self.fs.stat(path) {
            Ok(mtime) => mtime,
            Err(err) => {
                eprintln!("kiln: warning: stat {}: {}", path, err);
                MTime::Missing
            }
        }
    }

    /// Compute (and cache on the node) whether a node is out of date.
    /// Post-order: a node's inputs are decided before the node itself.
    pub fn recompute_dirty(&mut self, graph: &mut Graph, id: NodeId) -> bool {
        if let Some(dirty) = graph.node(id).dirty_known() {
            return dirty;
        }
        match graph.node(id).in_edge {
            None => {
                // A source file is dirty only when it doesn't exist.
                let dirty = self.stat(graph, id).is_missing();
                graph.set_dirty(id, dirty);
                dirty
            }
            Some(edge) => {
                let edge_dirty = self.recompute_edge_dirty(graph, edge);
                // One decision covers every output of the edge.
                for out in graph.edge(edge).outs.clone() {
                    if graph.node(out).dirty_known().is_some() {
                        continue;
                    }
                    let missing = self.stat(graph, out).is_missing();
                    graph.set_dirty(out, edge_dirty || missing);
                }
                graph.node(id).dirty()
            }
        }
    }

    fn recompute_edge_dirty(&mut self, graph: &mut Graph, id: EdgeId) -> bool {
        let mut dirty = false;
        let dirtying: Vec<NodeId> = graph.edge(id).dirtying_ins().collect();
        for input in dirtying {
            // Note: no short-circuit; every input's flag gets computed so
            // the plan can schedule producers for all of them.
            dirty |= self.recompute_dirty(graph, input);
        }
        // Order-only inputs don't make us dirty, but their subtrees still
        // need flags so the plan can want their producers.
        let order_only: Vec<NodeId> = graph.edge(id).order_only_ins().to_vec();
        for input in order_only {
            if graph.node(input).in_edge.is_some() {
                self.recompute_dirty(graph, input);
            }
        }
        if !dirty {
            dirty = self.outputs_dirty(graph, id);
        }
        dirty
    }

    /// The input-vs-output and build-log checks for one edge, assuming its
    /// inputs themselves are up to date.  Also used by the plan when a
    /// restat rule leaves an output untouched and downstream edges get a
    /// second look.
    pub fn outputs_dirty(&mut self, graph: &Graph, id: EdgeId) -> bool {
        let edge = graph.edge(id);
        if edge.outs.is_empty() {
            return true;
        }

        let mut oldest = MTime::Stamp(u64::MAX);
        for &out in &edge.outs {
            let mtime = self.stat(graph, out);
            if mtime < oldest {
                oldest = mtime;
            }
        }

        // An input newer than the oldest output, or either side missing.
        // Equal stamps are not newer.
        for input in edge.dirtying_ins() {
            let mtime = self.stat(graph, input);
            if mtime.is_missing() || oldest.is_missing() || mtime > oldest {
                return true;
            }
        }

        // A missing order-only input that nothing produces can never be
        // satisfied by running more of the plan.
        for &input in edge.order_only_ins() {
            if graph.node(input).in_edge.is_none() && self.stat(graph, input).is_missing() {
                return true;
            }
        }

        // Every output must be in the log, built by the same command.
        let command = graph.evaluate_command(id, true);
        let restat = graph.rule(edge.rule).restat;
        for &out in &edge.outs {
            match self.log.lookup(&graph.node(out).path) {
                None => return true,
                Some(entry) => {
                    if entry.command != command {
                        return true;
                    }
                    if restat && MTime::from_timestamp(entry.restat_mtime) > oldest {
                        return true;
                    }
                }
            }
        }

        false
    }
}
