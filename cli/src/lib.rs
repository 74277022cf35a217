// Tidemark
//
// Command surface, configuration, and the request server over the
// tidemark kernel.

pub mod app;
pub mod config;
pub mod protocol;
pub mod server;
