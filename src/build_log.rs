//! The build log stores one line per produced output recording the command
//! that built it and when, so later invocations can detect changed commands
//! and restat cutoffs.
//!
//! Each run appends to the log file; loading replays entries in series,
//! keeping only the newest per output.  Once the redundancy passes a
//! threshold the whole file is rewritten ("recompaction").

use crate::fs::MTime;
use crate::graph::{EdgeId, Graph};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};

const SIGNATURE_PREFIX: &str = "# ninja log v";
const CURRENT_VERSION: u32 = 4;

/// Load streams the file through this buffer; log lines are tiny, so the
/// only constraint is amortizing read syscalls.
const LOAD_BUF_SIZE: usize = 256 << 10;

const MIN_COMPACTION_ENTRIES: usize = 100;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug)]
pub struct LogEntry {
    pub output: String,
    /// The command as evaluated for the log; compared verbatim to detect
    /// command changes.
    pub command: String,
    /// Milliseconds since the start of the recording build.
    pub start_time: i32,
    pub end_time: i32,
    /// Timestamp form of the restat mtime; 0 when not a restat rule.
    pub restat_mtime: u64,
}

#[derive(Default)]
pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
    file: Option<File>,
    needs_recompaction: bool,
}

/// atoi()-style parse: leading digits, 0 on garbage.
fn atoi(buf: &[u8]) -> i64 {
    let (neg, digits) = match buf.first() {
        Some(b'-') => (true, &buf[1..]),
        _ => (false, buf),
    };
    let mut n: i64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            break;
        }
        n = n * 10 + (c - b'0') as i64;
    }
    if neg {
        -n
    } else {
        n
    }
}

fn write_entry(w: &mut impl Write, entry: &LogEntry) -> std::io::Result<()> {
    // One write per line keeps the appending file line-buffered.
    let line = format!(
        "{}\t{}\t{}\t{}\t{}\n",
        entry.start_time, entry.end_time, entry.restat_mtime, entry.output, entry.command
    );
    w.write_all(line.as_bytes())
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog::default()
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    /// Read a log file into memory.  A missing file is a fresh build and
    /// succeeds; any other I/O failure surfaces.
    pub fn load(&mut self, path: &str) -> anyhow::Result<()> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => bail!("load {}: {}", path, err),
        };

        let mut buf = vec![0u8; LOAD_BUF_SIZE];
        let mut filled = 0;
        let mut pos = 0;
        let mut log_version = 0u32;
        let mut unique_count = 0usize;
        let mut total_count = 0usize;

        loop {
            match buf[pos..filled].iter().position(|&c| c == b'\n') {
                None => {
                    // Move the partial line to the buffer start and refill
                    // the rest.
                    buf.copy_within(pos..filled, 0);
                    filled -= pos;
                    pos = 0;
                    let read = file
                        .read(&mut buf[filled..])
                        .map_err(|err| anyhow!("read {}: {}", path, err))?;
                    if read == 0 {
                        // EOF; an unterminated trailing line is dropped.
                        break;
                    }
                    filled += read;
                }
                Some(nl) => {
                    let line = &buf[pos..pos + nl];
                    pos += nl + 1;

                    if log_version == 0 {
                        // Logs predating the signature line count as v1.
                        log_version = 1;
                        if let Some(rest) = line.strip_prefix(SIGNATURE_PREFIX.as_bytes()) {
                            log_version = atoi(rest) as u32;
                            continue;
                        }
                    }

                    // v4 switched the field separator from space to tab so
                    // that commands may contain spaces.
                    let sep = if log_version >= 4 { b'\t' } else { b' ' };
                    let mut fields = line.splitn(5, |&c| c == sep);
                    let (start_time, end_time, restat_mtime, output, command) = match (
                        fields.next(),
                        fields.next(),
                        fields.next(),
                        fields.next(),
                        fields.next(),
                    ) {
                        (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
                        _ => continue, // malformed line, skip
                    };
                    let output = match std::str::from_utf8(output) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    let command = match std::str::from_utf8(command) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };

                    total_count += 1;
                    if !self.entries.contains_key(output) {
                        unique_count += 1;
                    }
                    self.entries.insert(
                        output.to_owned(),
                        LogEntry {
                            output: output.to_owned(),
                            command: command.to_owned(),
                            start_time: atoi(start_time) as i32,
                            end_time: atoi(end_time) as i32,
                            restat_mtime: atoi(restat_mtime) as u64,
                        },
                    );
                }
            }
        }

        // Decide whether it's time to rebuild the log: on a version
        // upgrade, or when it has grown mostly redundant.
        if log_version < CURRENT_VERSION {
            self.needs_recompaction = true;
        } else if total_count > MIN_COMPACTION_ENTRIES
            && total_count > unique_count * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }

        Ok(())
    }

    /// Prepare the log for appending.  Runs any pending recompaction
    /// first; if that fails the old log is left untouched and the log is
    /// not opened.
    pub fn open_for_write(&mut self, path: &str) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path)?;
            self.needs_recompaction = false;
        }

        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_CLOEXEC);
        }
        let mut file = options
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path, err))?;
        let len = file
            .metadata()
            .map_err(|err| anyhow!("stat {}: {}", path, err))?
            .len();
        if len == 0 {
            write!(file, "{}{}\n", SIGNATURE_PREFIX, CURRENT_VERSION)
                .map_err(|err| anyhow!("write {}: {}", path, err))?;
        }
        self.file = Some(file);
        Ok(())
    }

    /// Record a finished edge, one entry per output.  In-memory entries are
    /// updated even when the write fails or no file is open, so lookups
    /// stay correct for the rest of the invocation.
    pub fn record(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        start_time: i32,
        end_time: i32,
        restat_mtime: MTime,
    ) -> anyhow::Result<()> {
        let command = graph.evaluate_command(edge, true);
        let mut write_err = None;
        for &out in &graph.edge(edge).outs {
            let output = graph.node(out).path.clone();
            let entry = LogEntry {
                output: output.clone(),
                command: command.clone(),
                start_time,
                end_time,
                restat_mtime: restat_mtime.timestamp(),
            };
            if write_err.is_none() {
                if let Some(file) = &mut self.file {
                    if let Err(err) = write_entry(file, &entry) {
                        write_err = Some(err);
                    }
                }
            }
            self.entries.insert(output, entry);
        }
        if let Some(err) = write_err {
            bail!("write build log: {}", err);
        }
        Ok(())
    }

    /// Rewrite the log to contain only the live entries.  The new contents
    /// land in a sibling file that replaces the original only after a
    /// complete write.
    pub fn recompact(&mut self, path: &str) -> anyhow::Result<()> {
        self.close();
        let temp_path = format!("{}.recompact", path);
        let file =
            File::create(&temp_path).map_err(|err| anyhow!("create {}: {}", temp_path, err))?;
        let mut w = BufWriter::new(file);
        write!(w, "{}{}\n", SIGNATURE_PREFIX, CURRENT_VERSION)
            .map_err(|err| anyhow!("write {}: {}", temp_path, err))?;
        for entry in self.entries.values() {
            write_entry(&mut w, entry).map_err(|err| anyhow!("write {}: {}", temp_path, err))?;
        }
        w.into_inner()
            .map_err(|err| anyhow!("flush {}: {}", temp_path, err))?;
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {} over {}: {}", temp_path, path, err))?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InOut, Rule};

    /// A graph with `count` touch edges producing out0..outN.
    fn touch_graph(count: usize) -> (Graph, Vec<EdgeId>) {
        let mut graph = Graph::new();
        let rule = graph
            .add_rule(Rule::new("touch", "touch $out").unwrap())
            .unwrap();
        let edges = (0..count)
            .map(|i| {
                let edge = graph.add_edge(rule);
                graph
                    .add_in_out(edge, InOut::Out, &format!("out{}", i))
                    .unwrap();
                edge
            })
            .collect();
        (graph, edges)
    }

    fn line_count(path: &str) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn missing_file_is_fresh_build() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();
        let mut log = BuildLog::new();
        log.load(&path)?;
        assert_eq!(log.num_entries(), 0);
        assert!(!log.needs_recompaction());
        Ok(())
    }

    #[test]
    fn record_load_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();
        let (graph, edges) = touch_graph(2);

        let mut log = BuildLog::new();
        log.open_for_write(&path)?;
        log.record(&graph, edges[0], 0, 10, MTime::Missing)?;
        log.record(&graph, edges[1], 10, 25, MTime::Stamp(7))?;
        // Re-record the first output with newer values; the last write wins.
        log.record(&graph, edges[0], 30, 45, MTime::Missing)?;
        log.close();

        let mut log = BuildLog::new();
        log.load(&path)?;
        assert_eq!(log.num_entries(), 2);
        let entry = log.lookup("out0").unwrap();
        assert_eq!(entry.command, "touch out0");
        assert_eq!((entry.start_time, entry.end_time), (30, 45));
        let entry = log.lookup("out1").unwrap();
        assert_eq!(entry.restat_mtime, 7);
        assert!(!log.needs_recompaction());
        Ok(())
    }

    #[test]
    fn multiple_outputs_get_one_line_each() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();
        let mut graph = Graph::new();
        let rule = graph
            .add_rule(Rule::new("gen", "gen $out").unwrap())
            .unwrap();
        let edge = graph.add_edge(rule);
        graph.add_in_out(edge, InOut::Out, "a").unwrap();
        graph.add_in_out(edge, InOut::Out, "b").unwrap();

        let mut log = BuildLog::new();
        log.open_for_write(&path)?;
        log.record(&graph, edge, 0, 1, MTime::Missing)?;
        log.close();

        assert_eq!(line_count(&path), 3); // signature + one per output
        let mut log = BuildLog::new();
        log.load(&path)?;
        assert_eq!(log.lookup("a").unwrap().command, "gen a b");
        assert_eq!(log.lookup("b").unwrap().command, "gen a b");
        Ok(())
    }

    fn synthetic_log(total: usize, unique: usize) -> String {
        let mut content = format!("{}{}\n", SIGNATURE_PREFIX, CURRENT_VERSION);
        for i in 0..total {
            content.push_str(&format!("0\t1\t0\tout{}\ttouch out{}\n", i % unique, i % unique));
        }
        content
    }

    #[test]
    fn recompaction_threshold() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();

        // 100 total entries: under the threshold even though redundant.
        std::fs::write(&path, synthetic_log(100, 30))?;
        let mut log = BuildLog::new();
        log.load(&path)?;
        assert!(!log.needs_recompaction());

        // One more line crosses it.
        std::fs::write(&path, synthetic_log(101, 30))?;
        let mut log = BuildLog::new();
        log.load(&path)?;
        assert!(log.needs_recompaction());
        Ok(())
    }

    #[test]
    fn old_version_space_separated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();
        // v3 logs separate fields with spaces; the command keeps its own
        // spaces because only the first four separators split.
        std::fs::write(&path, "# ninja log v3\n5 20 0 x.o cc -c x.c -o x.o\n")?;
        let mut log = BuildLog::new();
        log.load(&path)?;
        // Any pre-v4 log gets recompacted regardless of entry counts.
        assert!(log.needs_recompaction());
        let entry = log.lookup("x.o").unwrap();
        assert_eq!((entry.start_time, entry.end_time), (5, 20));
        assert_eq!(entry.command, "cc -c x.c -o x.o");
        Ok(())
    }

    #[test]
    fn recompaction_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();
        let (graph, edges) = touch_graph(50);

        let mut log = BuildLog::new();
        log.open_for_write(&path)?;
        for round in 0..8 {
            for &edge in &edges {
                log.record(&graph, edge, round, round + 1, MTime::Missing)?;
            }
        }
        log.close();
        assert_eq!(line_count(&path), 401);

        // 400 total, 50 unique: 400 > 100 and 400 > 50*3.
        let mut log = BuildLog::new();
        log.load(&path)?;
        assert!(log.needs_recompaction());

        log.recompact(&path)?;
        assert_eq!(line_count(&path), 51); // signature + one per output

        let mut log = BuildLog::new();
        log.load(&path)?;
        assert_eq!(log.num_entries(), 50);
        assert!(!log.needs_recompaction());
        // Each survivor carries the last-recorded values.
        assert_eq!(log.lookup("out49").unwrap().start_time, 7);
        Ok(())
    }

    #[test]
    fn open_for_write_signs_empty_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").to_str().unwrap().to_owned();
        let mut log = BuildLog::new();
        log.open_for_write(&path)?;
        log.close();
        assert_eq!(std::fs::read_to_string(&path)?, "# ninja log v4\n");
        Ok(())
    }
}
