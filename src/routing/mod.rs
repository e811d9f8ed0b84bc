//! Route model, path rewriting rules, and bidirectional lookup.

pub mod route;
pub mod table;

pub use route::{join_paths, normalize_path, Route, RouteError, Upstream};
pub use table::RouteTable;
