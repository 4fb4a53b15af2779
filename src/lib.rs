pub mod blk;
pub mod cli;
pub mod config;
pub mod conflict;
pub mod importer;
pub mod install;
pub mod library;
pub mod logging;
pub mod manifest;
pub mod paths;
pub mod restore;
pub mod session;
