//! Open Food Facts MCP server.
//!
//! Exposes the Open Food Facts product database as a Model Context Protocol
//! tool server. A periodically refreshed Parquet snapshot of the upstream
//! dataset is queried in place through an embedded DuckDB engine; clients
//! reach the fixed tool catalog over a bearer-authenticated HTTP endpoint or
//! newline-framed stdio.
//!
//! # Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`store`] | Snapshot file, sidecar metadata, cross-process refresh lock |
//! | [`dataset`] | Freshness checks, single-writer download, atomic promotion |
//! | [`engine`] | DuckDB query execution, connection pool, retry, health probe |
//! | [`normalize`] | Legacy nutriments text → structured mapping |
//! | [`product`] | Product records and the simplified projection |
//! | [`rpc`] / [`mcp`] | JSON-RPC 2.0 framing and the MCP tool dispatcher |
//! | [`http`] / [`stdio`] | The two transports |

pub mod auth;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod normalize;
pub mod product;
pub mod rpc;
pub mod stdio;
pub mod store;
