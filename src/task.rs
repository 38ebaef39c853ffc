//! Runs build commands, potentially in parallel.  Unaware of the build
//! graph; just command execution.

use crate::graph::EdgeId;
use anyhow::bail;
use std::io::Write;
use std::sync::mpsc;
use std::time::Instant;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

pub struct FinishedTask {
    pub id: EdgeId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

#[derive(PartialEq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of executing a command.
pub struct TaskResult {
    pub termination: Termination,
    /// Console output, stdout and stderr combined.
    pub output: Vec<u8>,
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_str().unwrap());
    }
    Ok(())
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Execute a command line under /bin/sh.
/// We don't use Rust's process spawning because we want to feed both
/// stdout and stderr into the same pipe, which cannot be done with the
/// std::process API.
#[cfg(unix)]
fn run_command(cmdline: &str) -> anyhow::Result<TaskResult> {
    use std::io::Read;

    let (pid, mut pipe) = unsafe {
        use libc::*;
        use std::os::fd::FromRawFd;

        let mut pipe: [c_int; 2] = std::mem::zeroed();
        check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;

        let mut actions = PosixSpawnFileActions::new()?;
        // stdout/stderr => pipe
        actions.adddup2(pipe[1], 1)?;
        actions.adddup2(pipe[1], 2)?;
        // close pipe in child
        actions.addclose(pipe[0])?;
        actions.addclose(pipe[1])?;

        let mut pid: libc::pid_t = 0;
        let path = "/bin/sh\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline).unwrap();
        let argv: [*const libc::c_char; 4] = [
            path,
            "-c\0".as_ptr() as *const libc::c_char,
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        check_posix(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                path,
                actions.as_ptr(),
                std::ptr::null(),
                std::mem::transmute(&argv),
                std::ptr::null(),
            ),
        )?;

        check_posix("close", libc::close(pipe[1]))?;

        (pid, std::fs::File::from_raw_fd(pipe[0]))
    };

    let mut output = Vec::new();
    pipe.read_to_end(&mut output)?;

    let status = unsafe {
        let mut status: i32 = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted").unwrap();
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig).unwrap(),
            }
        }
    }

    Ok(TaskResult {
        termination,
        output,
    })
}

/// Executes commands in parallel: one waiting thread per running task,
/// results funneled back over a channel.
pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    running: usize,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            parallelism,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, id: EdgeId, cmdline: String) {
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = run_command(&cmdline).unwrap_or_else(|err| TaskResult {
                termination: Termination::Failure,
                output: err.to_string().into_bytes(),
            });
            let finish = Instant::now();

            let task = FinishedTask {
                id,
                span: (start, finish),
                result,
            };
            // The send only fails if the receiver disappeared, e.g. due to
            // shutting down.
            let _ = tx.send(task);
        });
        self.running += 1;
    }

    /// Wait for a task to complete.  May block for a long time.
    pub fn wait(&mut self) -> FinishedTask {
        let task = self.finished_recv.recv().unwrap();
        self.running -= 1;
        task
    }
}
