//! Build progress reporting, for the purpose of display to the user.

use crate::graph::EdgeId;
use crate::task::{TaskResult, Termination};
use std::io::Write;

/// Trait for build progress notifications.
pub trait Progress {
    /// Called when a task starts running.
    fn task_started(&mut self, id: EdgeId, desc: &str, cmdline: &str);

    /// Called when a task completes.
    fn task_finished(&mut self, id: EdgeId, desc: &str, result: &TaskResult);

    /// Log a line of output, e.g. a warning that should outlive progress
    /// updates.
    fn log(&mut self, msg: &str);

    /// Called when the build is done.
    fn finish(&mut self);
}

/// Progress implementation for a "dumb" console, without any overprinting.
pub struct DumbConsoleProgress {
    /// Whether to print the command lines of started programs instead of
    /// their descriptions.
    verbose: bool,

    /// The id of the last command printed, used to avoid printing it twice
    /// when we have two updates from the same command in a row.
    last_started: Option<EdgeId>,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        DumbConsoleProgress {
            verbose,
            last_started: None,
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn task_started(&mut self, id: EdgeId, desc: &str, cmdline: &str) {
        self.log(if self.verbose { cmdline } else { desc });
        self.last_started = Some(id);
    }

    fn task_finished(&mut self, id: EdgeId, desc: &str, result: &TaskResult) {
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() || self.last_started == Some(id) {
                    // Output is empty, or we just printed the command;
                    // don't print it again.
                } else {
                    self.log(desc)
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", desc)),
            Termination::Failure => self.log(&format!("failed: {}", desc)),
        }
        if !result.output.is_empty() {
            std::io::stdout().write_all(&result.output).unwrap();
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn finish(&mut self) {}
}
