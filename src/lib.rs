pub mod build_log;
pub mod densemap;
pub mod depfile;
pub mod deplist;
pub mod dirty;
pub mod eval;
pub mod fs;
pub mod graph;
pub mod plan;
pub mod progress;
pub mod scanner;
pub mod smallmap;
pub mod task;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
