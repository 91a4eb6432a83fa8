pub mod catalogue;
pub mod install;
