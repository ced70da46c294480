//! URL handling module for Image-Harvest
//!
//! This module provides URL normalization, relative reference resolution,
//! domain extraction, and host comparison for the same-domain crawl policy.

mod domain;
mod normalize;

// Re-export main functions
pub use domain::{extract_domain, same_host};
pub use normalize::{normalize_url, resolve_url};
