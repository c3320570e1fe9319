use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use tokio::fs;

use crate::error::{PipelineError, Result};
use crate::schema::ImageRef;

/// Reads a page image from disk into an inline `ImageRef`.
pub async fn load_page_image(path: &Path) -> Result<ImageRef> {
    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    if !mime_type.starts_with("image/") {
        return Err(PipelineError::Config(format!(
            "{} is not an image ({})",
            path.display(),
            mime_type
        )));
    }

    let bytes = fs::read(path).await?;
    Ok(ImageRef::Inline {
        mime_type,
        data: STANDARD.encode(bytes),
    })
}

pub async fn load_page_images(paths: &[impl AsRef<Path>]) -> Result<Vec<ImageRef>> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        images.push(load_page_image(path.as_ref()).await?);
    }
    Ok(images)
}
