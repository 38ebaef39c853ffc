//! Filesystem abstraction and the per-invocation stat cache.

use crate::densemap::DenseMap;
use crate::graph::{Graph, NodeId};

use std::os::unix::prelude::MetadataExt;

/// MTime info gathered for a file.  This also models "file is absent":
/// `Missing` orders before every stamp, so the oldest of a set of outputs
/// is `Missing` whenever one of them does not exist.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Missing,
    Stamp(u64),
}

impl MTime {
    pub fn is_missing(&self) -> bool {
        matches!(self, MTime::Missing)
    }

    /// The integer form used in the build log, where 0 means absent.
    pub fn timestamp(&self) -> u64 {
        match self {
            MTime::Missing => 0,
            MTime::Stamp(t) => *t,
        }
    }

    pub fn from_timestamp(t: u64) -> MTime {
        if t == 0 {
            MTime::Missing
        } else {
            MTime::Stamp(t)
        }
    }
}

/// The filesystem as seen by the engine.  The build driver is handed an
/// implementation; tests substitute an in-memory one.
pub trait FileSystem {
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &str) -> std::io::Result<MTime>;
}

pub struct RealFileSystem {}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        RealFileSystem::new()
    }
}

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(meta.mtime() as u64)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(err),
        }
    }
}

/// Memoized mtimes for graph nodes.  Populated on first query and never
/// invalidated within one build invocation; the only writes after that are
/// the plan recording post-execution output mtimes.
#[derive(Default)]
pub struct StatCache {
    mtimes: DenseMap<NodeId, Option<MTime>>,
}

impl StatCache {
    pub fn new() -> Self {
        StatCache {
            mtimes: DenseMap::new(),
        }
    }

    /// The cached mtime, if the node has been stat'ed (or touched).
    pub fn get(&self, id: NodeId) -> Option<MTime> {
        self.mtimes.lookup(id).copied().flatten()
    }

    pub fn set(&mut self, id: NodeId, mtime: MTime) {
        self.mtimes.set_grow(id, Some(mtime), None);
    }

    /// Fetch a node's mtime, consulting the filesystem only on the first
    /// query.  A stat failure is reported as a warning and treated as the
    /// file being absent; a bad source file will fail its build anyway.
    pub fn stat(&mut self, fs: &dyn FileSystem, graph: &Graph, id: NodeId) -> MTime {
        if let Some(mtime) = self.get(id) {
            return mtime;
        }
        let path = &graph.node(id).path;
        let mtime = match fs.stat(path) {
            Ok(mtime) => mtime,
            Err(err) => {
                eprintln!("kiln: warning: stat {}: {}", path, err);
                MTime::Missing
            }
        };
        self.set(id, mtime);
        mtime
    }

    /// Pretend a file was modified at the given time, dirtying everything
    /// downstream of it.  Test support; real builds learn mtimes from stat.
    pub fn touch(&mut self, graph: &mut Graph, path: &str, mtime: u64) {
        let id = graph.get_node(path);
        self.set(id, MTime::Stamp(mtime));
        graph.mark_dirty(id);
    }
}
