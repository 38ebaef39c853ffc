//! The build graph: rules, nodes (files) and edges (commands), plus
//! evaluation of an edge's command line.

use crate::densemap::{self, DenseMap};
use crate::eval::{Env, EvalString};
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::borrow::Cow;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(usize);
impl From<usize> for RuleId {
    fn from(u: usize) -> RuleId {
        RuleId(u)
    }
}
impl densemap::Index for RuleId {
    fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u)
    }
}
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(usize);
impl From<usize> for EdgeId {
    fn from(u: usize) -> EdgeId {
        EdgeId(u)
    }
}
impl densemap::Index for EdgeId {
    fn index(&self) -> usize {
        self.0
    }
}

/// A named command template.  Immutable once added to the graph.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub command: EvalString<String>,
    pub description: Option<EvalString<String>>,
    pub depfile: Option<EvalString<String>>,
    pub restat: bool,
}

impl Rule {
    pub fn new(name: impl Into<String>, command: &str) -> anyhow::Result<Rule> {
        Ok(Rule {
            name: name.into(),
            command: EvalString::parse(command)?,
            description: None,
            depfile: None,
            restat: false,
        })
    }
}

/// A file tracked by the graph.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    /// The edge that produces this file, if any.
    pub in_edge: Option<EdgeId>,
    /// Edges that consume this file as an input.
    pub out_edges: Vec<EdgeId>,
    /// Cached dirtiness; None until the scanner (or a touch) decides.
    dirty: Option<bool>,
}

impl Node {
    pub fn dirty(&self) -> bool {
        self.dirty.unwrap_or(false)
    }

    pub(crate) fn dirty_known(&self) -> Option<bool> {
        self.dirty
    }
}

/// Progress of one edge through a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    /// Not part of the current plan.
    Unknown,
    /// Needs to run, waiting on generated inputs.
    Want,
    /// All generated inputs done; queued to run.
    Ready,
    Running,
    Finished,
    Failed,
}

/// The slot an `add_in_out` path lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InOut {
    /// Explicit input; listed in `$in` and checked for dirtiness.
    In,
    /// Implicit input; checked for dirtiness but not in `$in`.
    Implicit,
    /// Order-only input; scheduling dependency only.
    OrderOnly,
    Out,
}

/// One build step: a rule applied to concrete inputs and outputs.
#[derive(Debug)]
pub struct Edge {
    pub rule: RuleId,
    /// Inputs, partitioned explicit | implicit | order-only by the two
    /// counts below.
    ins: Vec<NodeId>,
    explicit_ins: usize,
    implicit_ins: usize,
    /// Deps discovered via the deplist database; treated as implicit.
    discovered_ins: Vec<NodeId>,
    pub outs: Vec<NodeId>,
    /// Edge-scoped variable bindings.
    pub env: SmallMap<String, String>,
    pub state: EdgeState,
}

impl Edge {
    pub fn explicit_ins(&self) -> &[NodeId] {
        &self.ins[..self.explicit_ins]
    }

    pub fn order_only_ins(&self) -> &[NodeId] {
        &self.ins[self.explicit_ins + self.implicit_ins..]
    }

    pub fn discovered_ins(&self) -> &[NodeId] {
        &self.discovered_ins
    }

    /// The inputs whose changes make this edge out of date: explicit,
    /// implicit and discovered, but not order-only.
    pub fn dirtying_ins(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ins[..self.explicit_ins + self.implicit_ins]
            .iter()
            .chain(self.discovered_ins.iter())
            .copied()
    }

    /// All inputs, including order-only ones.
    pub fn all_ins(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ins
            .iter()
            .chain(self.discovered_ins.iter())
            .copied()
    }
}

/// Owner of all rules, nodes and edges.  Cross-references are ids into the
/// arenas here, so the Node<->Edge links never form ownership cycles.
#[derive(Default)]
pub struct Graph {
    rules: DenseMap<RuleId, Rule>,
    rules_by_name: HashMap<String, RuleId>,
    nodes: DenseMap<NodeId, Node>,
    nodes_by_path: HashMap<String, NodeId>,
    edges: DenseMap<EdgeId, Edge>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_rule(&mut self, rule: Rule) -> anyhow::Result<RuleId> {
        if self.rules_by_name.contains_key(&rule.name) {
            bail!("duplicate rule '{}'", rule.name);
        }
        let name = rule.name.clone();
        let id = self.rules.push(rule);
        self.rules_by_name.insert(name, id);
        Ok(id)
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        self.rules.get(id)
    }

    /// Intern a path, creating its node on first reference.
    pub fn get_node(&mut self, path: &str) -> NodeId {
        if let Some(&id) = self.nodes_by_path.get(path) {
            return id;
        }
        let id = self.nodes.push(Node {
            path: path.to_owned(),
            in_edge: None,
            out_edges: Vec::new(),
            dirty: None,
        });
        self.nodes_by_path.insert(path.to_owned(), id);
        id
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.nodes_by_path.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn add_edge(&mut self, rule: RuleId) -> EdgeId {
        self.edges.push(Edge {
            rule,
            ins: Vec::new(),
            explicit_ins: 0,
            implicit_ins: 0,
            discovered_ins: Vec::new(),
            outs: Vec::new(),
            env: SmallMap::new(),
            state: EdgeState::Unknown,
        })
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.get(id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(id)
    }

    /// Attach a path to an edge in the given slot, interning the node and
    /// maintaining the producer/consumer backlinks.
    pub fn add_in_out(&mut self, id: EdgeId, kind: InOut, path: &str) -> anyhow::Result<()> {
        let node = self.get_node(path);
        let edge = self.edges.get_mut(id);
        match kind {
            InOut::In => {
                edge.ins.insert(edge.explicit_ins, node);
                edge.explicit_ins += 1;
            }
            InOut::Implicit => {
                edge.ins.insert(edge.explicit_ins + edge.implicit_ins, node);
                edge.implicit_ins += 1;
            }
            InOut::OrderOnly => {
                edge.ins.push(node);
            }
            InOut::Out => {
                edge.outs.push(node);
                let node = self.nodes.get_mut(node);
                if node.in_edge.is_some() {
                    bail!("multiple rules generate {}", node.path);
                }
                node.in_edge = Some(id);
                return Ok(());
            }
        }
        let node = self.nodes.get_mut(node);
        if !node.out_edges.contains(&id) {
            node.out_edges.push(id);
        }
        Ok(())
    }

    /// Register a dep learned from the deplist database as an implicit
    /// input of the edge.  Duplicates of already-known inputs are ignored.
    pub fn add_discovered_dep(&mut self, id: EdgeId, path: &str) {
        let node = self.get_node(path);
        let edge = self.edges.get_mut(id);
        if edge.ins.contains(&node) || edge.discovered_ins.contains(&node) {
            return;
        }
        edge.discovered_ins.push(node);
        let node = self.nodes.get_mut(node);
        if !node.out_edges.contains(&id) {
            node.out_edges.push(id);
        }
    }

    pub(crate) fn set_dirty(&mut self, id: NodeId, dirty: bool) {
        self.nodes.get_mut(id).dirty = Some(dirty);
    }

    /// Mark a node modified, dirtying its transitive consumers.  Edges that
    /// see the node only as an order-only input are not dirtied by it.
    pub fn mark_dirty(&mut self, id: NodeId) {
        if self.node(id).dirty == Some(true) {
            return;
        }
        self.nodes.get_mut(id).dirty = Some(true);
        let out_edges = self.node(id).out_edges.clone();
        for eid in out_edges {
            if !self.edge(eid).dirtying_ins().any(|n| n == id) {
                continue;
            }
            for out in self.edge(eid).outs.clone() {
                self.mark_dirty(out);
            }
        }
    }

    fn paths_joined(&self, ids: &[NodeId]) -> String {
        let mut s = String::new();
        for (i, &id) in ids.iter().enumerate() {
            if i > 0 {
                s.push(' ');
            }
            s.push_str(&self.node(id).path);
        }
        s
    }

    /// Expand the edge's command template.  `for_log` selects the
    /// canonical form recorded in the build log; today it is the same
    /// string that gets executed.
    pub fn evaluate_command(&self, id: EdgeId, _for_log: bool) -> String {
        let edge = self.edge(id);
        let env = EdgeEnv {
            graph: self,
            edge,
            rule_vars: true,
        };
        self.rule(edge.rule).command.evaluate(&[&env])
    }

    pub fn evaluate_description(&self, id: EdgeId) -> Option<String> {
        let edge = self.edge(id);
        let env = EdgeEnv {
            graph: self,
            edge,
            rule_vars: false,
        };
        self.rule(edge.rule)
            .description
            .as_ref()
            .map(|desc| desc.evaluate(&[&env]))
    }

    pub fn evaluate_depfile(&self, id: EdgeId) -> Option<String> {
        let edge = self.edge(id);
        let env = EdgeEnv {
            graph: self,
            edge,
            rule_vars: false,
        };
        self.rule(edge.rule)
            .depfile
            .as_ref()
            .map(|depfile| depfile.evaluate(&[&env]))
    }
}

/// Environment for expanding an edge's templates: the `$in`/`$out`
/// specials, then edge bindings, then rule-level bindings, then empty.
struct EdgeEnv<'a> {
    graph: &'a Graph,
    edge: &'a Edge,
    /// Rule-level bindings are hidden while expanding a rule-level binding
    /// itself, so lookup cannot recurse.
    rule_vars: bool,
}

impl<'a> Env for EdgeEnv<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        match var {
            "in" => Some(Cow::Owned(
                self.graph.paths_joined(self.edge.explicit_ins()),
            )),
            "out" => Some(Cow::Owned(self.graph.paths_joined(&self.edge.outs))),
            _ => {
                if let Some(val) = self.edge.env.get(var) {
                    return Some(Cow::Borrowed(val.as_str()));
                }
                if !self.rule_vars {
                    return None;
                }
                let rule = self.graph.rule(self.edge.rule);
                let template = match var {
                    "description" => rule.description.as_ref(),
                    "depfile" => rule.depfile.as_ref(),
                    _ => None,
                }?;
                let env = EdgeEnv {
                    graph: self.graph,
                    edge: self.edge,
                    rule_vars: false,
                };
                Some(Cow::Owned(template.evaluate(&[&env])))
            }
        }
    }
}
