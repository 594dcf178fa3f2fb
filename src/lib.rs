pub mod cache;
pub mod cgi;
pub mod config;
pub mod error;
pub mod gopher;
pub mod gophermap;
pub mod http;
pub mod path;
pub mod policy;
pub mod request;
pub mod worker;

/// Conventional name of the menu file looked up in each directory.
pub const GOPHERMAP: &str = "gophermap";
