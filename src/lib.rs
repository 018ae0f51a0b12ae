//! # CSV Search
//!
//! Federated search over a directory of large CSV files.
//!
//! Files are discovered under a source root and their headers unified into
//! a column catalog. On first search (or ahead of time via `csvs convert`)
//! each file is converted into a typed, indexed SQLite table. A search over
//! one column runs one bounded query per file in parallel, streams rows as
//! files finish, and caches the merged outcome.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  CSV files  │──▶│   Catalog   │   │    SQLite    │
//! │ source root │──▶│  Converter  │──▶│ one table    │
//! └─────────────┘   └─────────────┘   │ per file     │
//!                                     └──────┬───────┘
//!                                            │
//!                    ┌──────────────┐  ┌─────┴────────┐
//!                    │ Query cache  │◀─│ Orchestrator │
//!                    └──────────────┘  └─────┬────────┘
//!                                            │
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │   CLI    │         │   HTTP   │
//!                 │  (csvs)  │         │  (axum)  │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csvs init
//! csvs catalog
//! csvs convert --progress human
//! csvs search name apple --mode exact
//! csvs serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error types per stage |
//! | [`catalog`] | File discovery and column catalog |
//! | [`coerce`] | Column type rules and value coercion |
//! | [`convert`] | CSV to SQLite table conversion |
//! | [`cache`] | TTL + LRU query cache |
//! | [`search`] | Parallel per-file search and result merging |
//! | [`export`] | CSV, XLSX and JSON export |
//! | [`history`] | Search history |
//! | [`engine`] | Facade tying the above together |
//! | [`stats`] | Dataset statistics |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`progress`] | Conversion progress reporting |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache;
pub mod catalog;
pub mod coerce;
pub mod config;
pub mod convert;
pub mod db;
pub mod engine;
pub mod error;
pub mod export;
pub mod history;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod search;
pub mod server;
pub mod stats;
