//! Remote image storage.
//!
//! Only images whose predictions carry the gate label are uploaded. The blob
//! name is the local file name, so the metadata `image_path` and the blob can
//! be matched later.

use anyhow::Result;
use std::path::Path;

mod azure_blob;

pub use azure_blob::{AzureBlobStore, StorageConnectionString, DEFAULT_CONTAINER};

pub trait BlobStore {
    fn upload(
        &mut self,
        path: &Path,
        blob_name: &str,
        content_type: &str,
        overwrite: bool,
    ) -> Result<()>;
}
