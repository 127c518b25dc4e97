//! Configuration loading and allocator construction.
//!
//! Construction errors are fatal: a daemon with a broken pipeline or an
//! invalid owner-server rule never starts serving.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use designate_alloc::Allocator;
use designate_core::DesignateConfig;

/// Load `path` and build the allocator it describes.
pub fn load(path: &Path) -> anyhow::Result<(DesignateConfig, Allocator)> {
    let config = DesignateConfig::from_file(path)?;
    let allocator = Allocator::new(&config.allocation(), config.defaults.clone())
        .with_context(|| format!("invalid allocation pipeline in {}", path.display()))?;
    info!(path = %path.display(), pipeline = %allocator.expr(), "configuration loaded");
    Ok((config, allocator))
}
