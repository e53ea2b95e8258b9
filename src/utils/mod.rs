pub mod connection;
pub mod diagnostics;
pub mod locks;
pub mod secret;

use std::path::Path;

use tempfile::{Builder, TempDir};

use crate::errors::Result;

/// Creates an isolated scratch directory that is removed when dropped.
pub fn scratch_workspace(root: Option<&Path>, prefix: &str) -> Result<TempDir> {
    let mut builder = Builder::new();
    builder.prefix(prefix);
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}
