//! corpusgrab - resumable bulk acquisition of paginated document disclosures.
//!
//! Documents are identified by a fixed-width key (prefix + zero-padded
//! integer). Keys are discovered by scraping paginated index listings or by
//! enumerating an integer range, queued in a SQLite-backed work store, and
//! downloaded by a pool of concurrent workers. Progress survives restarts.

pub mod config;
pub mod engine;
pub mod extract;
pub mod fetch;
pub mod models;
pub mod repository;
pub mod storage;
pub mod utils;
