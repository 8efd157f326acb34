mod atomic;
mod file_watcher;

pub use atomic::*;
pub use file_watcher::*;
