//! vpkhub - Left 4 Dead 2 addon manager
//!
//! Scans the `addons` directory for VPK archives, classifies and searches
//! them, detects overlapping resource paths, keeps `addonlist.txt` in order
//! and runs workshop downloads in the background.

pub mod catalog;
pub mod config;
pub mod conflict;
pub mod discover;
pub mod download;
pub mod error;
pub mod ingest;
pub mod layout;
pub mod load_order;
pub mod mutator;
pub mod notify;
pub mod paths;
pub mod progress;
pub mod rotation;
pub mod session;
pub mod tags;
pub mod vpk;

pub use error::AppError;
pub use session::AppSession;
