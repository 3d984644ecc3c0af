pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod manifest;
pub mod output;
pub mod reconcile;
pub mod store;
pub mod text;
pub mod upload;
