pub mod build_info;
pub mod cli;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod logs;
pub mod procs;
pub mod registry;
pub mod report;
