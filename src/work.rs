//! The build driver: pulls ready edges from the plan, executes them, and
//! feeds results back into the plan and the build log.

use crate::build_log::BuildLog;
use crate::dirty::DependencyScan;
use crate::fs::{FileSystem, MTime, StatCache};
use crate::graph::{EdgeId, Graph, NodeId};
use crate::plan::Plan;
use crate::progress::Progress;
use crate::task::{FinishedTask, Runner, Termination};
use anyhow::bail;
use std::time::Instant;

pub struct Options {
    /// How many commands may run at once.
    pub parallelism: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options { parallelism: 1 }
    }
}

/// One build invocation's state.  The graph and build log outlive it; the
/// plan, stat cache and runner do not.
pub struct Work<'a> {
    fs: &'a dyn FileSystem,
    graph: &'a mut Graph,
    log: &'a mut BuildLog,
    progress: &'a mut dyn Progress,
    cache: StatCache,
    plan: Plan,
    runner: Runner,
    start: Instant,
}

impl<'a> Work<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        graph: &'a mut Graph,
        log: &'a mut BuildLog,
        progress: &'a mut dyn Progress,
        options: &Options,
    ) -> Self {
        Work {
            fs,
            graph,
            log,
            progress,
            cache: StatCache::new(),
            plan: Plan::new(),
            runner: Runner::new(options.parallelism),
            start: Instant::now(),
        }
    }

    pub fn want_file(&mut self, path: &str) -> anyhow::Result<()> {
        match self.graph.lookup_node(path) {
            Some(id) => self.want_node(id),
            None => bail!("unknown target '{}'", path),
        }
    }

    pub fn want_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        {
            let mut scan = DependencyScan::new(self.fs, &mut self.cache, self.log);
            scan.recompute_dirty(self.graph, id);
        }
        self.plan.add_target_node(self.graph, id)
    }

    fn millis_since_start(&self, t: Instant) -> i32 {
        t.duration_since(self.start).as_millis() as i32
    }

    fn start_task(&mut self, id: EdgeId) {
        let cmdline = self.graph.evaluate_command(id, false);
        let desc = self
            .graph
            .evaluate_description(id)
            .filter(|desc| !desc.is_empty())
            .unwrap_or_else(|| cmdline.clone());
        self.progress.task_started(id, &desc, &cmdline);
        self.runner.start(id, cmdline);
    }

    /// The restat mtime to record for an edge whose rule is restat: the
    /// newest input, kept monotonic with anything the log already holds
    /// for the edge's outputs.
    fn restat_mtime(&mut self, id: EdgeId) -> MTime {
        let mut newest = MTime::Missing;
        {
            let mut scan = DependencyScan::new(self.fs, &mut self.cache, self.log);
            let ins: Vec<NodeId> = self.graph.edge(id).dirtying_ins().collect();
            for input in ins {
                let mtime = scan.stat(self.graph, input);
                if mtime > newest {
                    newest = mtime;
                }
            }
        }
        for &out in &self.graph.edge(id).outs {
            if let Some(entry) = self.log.lookup(&self.graph.node(out).path) {
                let logged = MTime::from_timestamp(entry.restat_mtime);
                if logged > newest {
                    newest = logged;
                }
            }
        }
        newest
    }

    fn finish_task(&mut self, fin: FinishedTask) {
        let id = fin.id;
        let desc = self
            .graph
            .evaluate_description(id)
            .filter(|desc| !desc.is_empty())
            .unwrap_or_else(|| self.graph.evaluate_command(id, false));
        self.progress.task_finished(id, &desc, &fin.result);

        if fin.result.termination != Termination::Success {
            let mut scan = DependencyScan::new(self.fs, &mut self.cache, self.log);
            self.plan
                .edge_finished(self.graph, &mut scan, id, false, MTime::Missing);
            return;
        }

        let restat = self.graph.rule(self.graph.edge(id).rule).restat;
        let restat_mtime = if restat {
            self.restat_mtime(id)
        } else {
            MTime::Missing
        };
        {
            let mut scan = DependencyScan::new(self.fs, &mut self.cache, self.log);
            self.plan
                .edge_finished(self.graph, &mut scan, id, true, restat_mtime);
        }

        let start = self.millis_since_start(fin.span.0);
        let end = self.millis_since_start(fin.span.1);
        if let Err(err) = self.log.record(self.graph, id, start, end, restat_mtime) {
            // A dead log loses history for future runs but doesn't affect
            // this one; in-memory entries are already updated.
            self.progress
                .log(&format!("kiln: warning: {}; continuing without log", err));
            self.log.close();
        }
    }

    /// Run everything wanted.  Returns how many tasks ran, or None if any
    /// of them failed.
    pub fn run(&mut self) -> anyhow::Result<Option<usize>> {
        let mut tasks_ran = 0;
        loop {
            while self.runner.can_start_more() {
                let id = match self.plan.find_work(self.graph) {
                    Some(id) => id,
                    None => break,
                };
                self.start_task(id);
            }
            if !self.runner.is_running() {
                break;
            }
            let fin = self.runner.wait();
            tasks_ran += 1;
            self.finish_task(fin);
        }
        self.progress.finish();

        if self.plan.failed() > 0 {
            return Ok(None);
        }
        if self.plan.pending() > 0 {
            // Nothing ready, nothing running, but work remains: the graph
            // has a cycle among the wanted edges.
            bail!("dependency cycle in build graph");
        }
        Ok(Some(tasks_ran))
    }
}
