//! The deplist database: a persistent map from a target-index name to the
//! dependency paths discovered while building that target.  The dirtiness
//! scanner consumes these as extra implicit inputs; the `kiln-deplist`
//! helper writes them from compiler output.
//!
//! On-disk this is a binary append-only file of two record kinds: a path
//! record interning the next path id, and a deps record tying a target id
//! to its dep ids.  Loading replays the file; the last deps record per
//! target wins.

use crate::graph::Graph;
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

/// High bit of a record's leading u16 distinguishes deps records from path
/// records; the rest is the dep count or the path length.
const DEPS_RECORD_FLAG: u16 = 0x8000;

/// Loaded deplist state.  Paths are interned; ids are stable across runs
/// because records are only ever appended.
#[derive(Default)]
pub struct Deplist {
    names: Vec<String>,
    ids: HashMap<String, usize>,
    deps: HashMap<usize, Vec<usize>>,
}

impl Deplist {
    fn intern(&mut self, name: String) -> usize {
        if let Some(&id) = self.ids.get(&name) {
            return id;
        }
        let id = self.names.len();
        self.ids.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn lookup(&self, target: &str) -> Option<Vec<&str>> {
        let id = *self.ids.get(target)?;
        let deps = self.deps.get(&id)?;
        Some(deps.iter().map(|&d| self.names[d].as_str()).collect())
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(|&id| self.names[id].as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

/// Feed a deplist's entries into the graph: each target that the graph
/// knows how to build gains the recorded deps as implicit inputs.
pub fn apply(graph: &mut Graph, deplist: &Deplist) {
    let targets: Vec<String> = deplist.targets().map(str::to_owned).collect();
    for target in targets {
        let node = match graph.lookup_node(&target) {
            Some(node) => node,
            None => continue,
        };
        let edge = match graph.node(node).in_edge {
            Some(edge) => edge,
            None => continue,
        };
        for dep in deplist.lookup(&target).unwrap() {
            graph.add_discovered_dep(edge, dep);
        }
    }
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u24(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf)?;
    Ok(((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32)
}

fn write_u24(w: &mut impl Write, id: usize) -> anyhow::Result<()> {
    if id >= 1 << 24 {
        bail!("deplist: too many paths");
    }
    let n = id as u32;
    w.write_all(&[(n >> 16) as u8, (n >> 8) as u8, n as u8])?;
    Ok(())
}

fn read(list: &mut Deplist, f: &mut File) -> anyhow::Result<()> {
    let mut r = BufReader::new(f);
    loop {
        let tag = match read_u16(&mut r) {
            Ok(tag) => tag,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => bail!("read deplist: {}", err),
        };
        if tag & DEPS_RECORD_FLAG == 0 {
            let mut buf = vec![0; tag as usize];
            r.read_exact(&mut buf)
                .map_err(|err| anyhow!("read deplist: {}", err))?;
            let name =
                String::from_utf8(buf).map_err(|_| anyhow!("deplist: non-utf8 path"))?;
            list.intern(name);
        } else {
            let count = (tag & !DEPS_RECORD_FLAG) as usize;
            let target = read_u24(&mut r).map_err(|err| anyhow!("read deplist: {}", err))? as usize;
            let mut deps = Vec::with_capacity(count);
            for _ in 0..count {
                let dep = read_u24(&mut r).map_err(|err| anyhow!("read deplist: {}", err))? as usize;
                if dep >= list.names.len() {
                    bail!("deplist: dep id {} out of range", dep);
                }
                deps.push(dep);
            }
            if target >= list.names.len() {
                bail!("deplist: target id {} out of range", target);
            }
            list.deps.insert(target, deps);
        }
    }
    Ok(())
}

/// Load a deplist without opening it for writes.  A missing file is an
/// empty deplist.
pub fn load(path: &str) -> anyhow::Result<Deplist> {
    let mut list = Deplist::default();
    match File::open(path) {
        Ok(mut f) => read(&mut list, &mut f)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => bail!("open {}: {}", path, err),
    }
    Ok(list)
}

/// An opened database, ready for appends.
pub struct Writer {
    list: Deplist,
    w: BufWriter<File>,
}

/// Open an on-disk deplist for updates, creating it if absent.
pub fn open(path: &str) -> anyhow::Result<Writer> {
    let mut list = Deplist::default();
    let file = match std::fs::OpenOptions::new().read(true).append(true).open(path) {
        Ok(mut f) => {
            read(&mut list, &mut f)?;
            f
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => File::create(path)
            .map_err(|err| anyhow!("create {}: {}", path, err))?,
        Err(err) => bail!("open {}: {}", path, err),
    };
    Ok(Writer {
        list,
        w: BufWriter::new(file),
    })
}

impl Writer {
    pub fn list(&self) -> &Deplist {
        &self.list
    }

    fn ensure_id(&mut self, name: &str) -> anyhow::Result<usize> {
        if let Some(&id) = self.list.ids.get(name) {
            return Ok(id);
        }
        if name.len() >= DEPS_RECORD_FLAG as usize {
            bail!("deplist: path too long: {:?}", name);
        }
        if name.is_empty() {
            bail!("deplist: empty path");
        }
        self.w.write_all(&(name.len() as u16).to_be_bytes())?;
        self.w.write_all(name.as_bytes())?;
        Ok(self.list.intern(name.to_owned()))
    }

    /// Record the dependency list for one target, interning any paths not
    /// yet in the file.  Each record is flushed whole so a crash can only
    /// lose the tail.
    pub fn write_deps(&mut self, target: &str, deps: &[&str]) -> anyhow::Result<()> {
        let mut dep_ids = Vec::with_capacity(deps.len());
        for dep in deps {
            dep_ids.push(self.ensure_id(dep)?);
        }
        if dep_ids.len() >= DEPS_RECORD_FLAG as usize {
            bail!("deplist: too many deps for {}", target);
        }
        let target_id = self.ensure_id(target)?;

        let tag = DEPS_RECORD_FLAG | dep_ids.len() as u16;
        self.w.write_all(&tag.to_be_bytes())?;
        write_u24(&mut self.w, target_id)?;
        for &dep in &dep_ids {
            write_u24(&mut self.w, dep)?;
        }
        self.w.flush()?;

        self.list.deps.insert(target_id, dep_ids);
        Ok(())
    }
}
