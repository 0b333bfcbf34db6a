pub mod app;
pub mod archive;
pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod grouping;
pub mod http;
pub mod literature;
pub mod output;
pub mod state;
