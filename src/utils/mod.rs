pub mod file;
pub mod format;
pub mod paths;
pub mod process;
