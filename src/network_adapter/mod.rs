// src/network_adapter/mod.rs
pub mod ndjson;
pub mod r#trait; // Using r# to use the keyword `trait` as a module name

pub use ndjson::NdjsonAdapter;
pub use r#trait::{BoxedAdapter, NetworkAdapter};
