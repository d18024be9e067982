#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod pipeline;
pub mod query;
pub mod report;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../onto/mod.rs"]
pub mod onto;

#[path = "../network/mod.rs"]
pub mod network;

#[path = "../diffuse/mod.rs"]
pub mod diffuse;
