use std::io::Cursor;

use image::{ImageFormat, RgbImage};
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};

use crate::{ImagineError, Result, model::GeneratedImage};

/// File name under which the artifact is offered for download.
pub const ARTIFACT_FILE_NAME: &str = "generated_image.png";

/// MIME type of the artifact.
pub const ARTIFACT_MIME_TYPE: &str = "image/png";

/// A generated image serialized to PNG, ready to be displayed or downloaded.
#[derive(Clone, Debug)]
pub struct EncodedArtifact {
    bytes: Vec<u8>,
    size: ImageSize,
}

impl EncodedArtifact {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Dimensions of the encoded image.
    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn file_name(&self) -> &'static str {
        ARTIFACT_FILE_NAME
    }

    pub fn mime_type(&self) -> &'static str {
        ARTIFACT_MIME_TYPE
    }

    /// Value for a `Content-Disposition` header offering the artifact as a file.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", ARTIFACT_FILE_NAME)
    }
}

/// Serializes an RGB8 image to PNG.
pub fn encode(image: &GeneratedImage) -> Result<EncodedArtifact> {
    let size = image.size();
    let buffer = RgbImage::from_raw(
        size.width as u32,
        size.height as u32,
        image.as_slice().to_vec(),
    )
    .ok_or_else(|| {
        ImagineError::Generation(format!(
            "pixel buffer does not match {}x{}",
            size.width, size.height
        ))
    })?;

    let mut bytes = Vec::new();
    buffer.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

    log::debug!(
        "Encoded {}x{} image into {} bytes",
        size.width,
        size.height,
        bytes.len()
    );

    Ok(EncodedArtifact { bytes, size })
}

/// Decodes PNG bytes into an RGB8 image. Alpha and palette images are converted.
pub fn decode(bytes: &[u8]) -> Result<GeneratedImage> {
    let buffer = image::load_from_memory_with_format(bytes, ImageFormat::Png)?.into_rgb8();
    let size = ImageSize {
        width: buffer.width() as usize,
        height: buffer.height() as usize,
    };
    Ok(Image::new(size, buffer.into_raw(), CpuAllocator)?)
}
