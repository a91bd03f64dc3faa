/// The version of this crate, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
