pub mod app;
pub mod archive;
pub mod catalog;
pub mod cds;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod grid;
pub mod merge;
pub mod nc;
pub mod normalize;
pub mod opener;
pub mod output;
pub mod pool;
pub mod store;
