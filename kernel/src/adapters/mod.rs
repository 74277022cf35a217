// External adapters.

pub mod files;
