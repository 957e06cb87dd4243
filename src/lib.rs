pub mod config;
pub mod error;
pub mod fanout;
pub mod http;
pub mod keys;
pub mod render;
pub mod session;
pub mod version;
