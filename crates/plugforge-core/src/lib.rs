pub mod addon;
pub mod builders;
pub mod clean;
pub mod config;
pub mod deploy;
pub mod document;
pub mod downloader;
pub mod error;
pub mod feature;
pub mod io;
pub mod paths;
pub mod recipe;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod signals;
pub mod tag;

pub use error::{ForgeError, Result};
