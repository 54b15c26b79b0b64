use std::path::{Path, PathBuf};

use futures::future::join_all;
use tracing::{debug, info};

use crate::{
    error::Result,
    task::config::VendorMapping,
    util::remove_path,
};

/// Removes the vendor directory. Succeeds when it is already gone.
pub async fn clean(root: &Path, vendor_dir: &Path) -> Result<()> {
    remove_path(&root.join(vendor_dir)).await?;
    Ok(())
}

/// Copies every mapping's files into its destination, preserving paths
/// relative to the source glob base. Returns the number of files copied.
pub async fn copy_modules(root: &Path, mappings: &[VendorMapping]) -> Result<usize> {
    let results = join_all(mappings.iter().map(|mapping| copy_mapping(root, mapping))).await;

    let mut copied = 0;
    for result in results {
        copied += result?;
    }

    info!("Copied {} vendor file(s)", copied);
    Ok(copied)
}

/// Every file a copy of `mappings` writes.
pub fn outputs(root: &Path, mappings: &[VendorMapping]) -> Result<Vec<PathBuf>> {
    let mut outputs = Vec::new();
    for mapping in mappings {
        let dest = root.join(&mapping.dest);
        outputs.extend(
            mapping
                .src
                .resolve(root)?
                .into_iter()
                .map(|file| dest.join(file.relative)),
        );
    }
    Ok(outputs)
}

async fn copy_mapping(root: &Path, mapping: &VendorMapping) -> Result<usize> {
    let files = mapping.src.resolve(root)?;
    let dest = root.join(&mapping.dest);

    for file in &files {
        let target = dest.join(&file.relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&file.path, &target).await?;
    }

    debug!("{} file(s) -> {}", files.len(), mapping.dest.display());
    Ok(files.len())
}
