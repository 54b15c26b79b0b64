use std::path::{Path, PathBuf};

use image::{ColorType, ImageFormat, codecs::jpeg::JpegEncoder};
use tracing::{debug, info};

use super::blocking;
use crate::{
    error::{PipelineError, Result},
    task::config::ImagesConfig,
    util::write_output,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageKind {
    Png,
    Jpeg,
    Svg,
    Other,
}

impl ImageKind {
    fn of(path: &Path) -> ImageKind {
        let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()) else {
            return ImageKind::Other;
        };
        match ext.as_str() {
            "png" => ImageKind::Png,
            "jpg" | "jpeg" => ImageKind::Jpeg,
            "svg" => ImageKind::Svg,
            _ => ImageKind::Other,
        }
    }
}

/// Optimizes PNG, JPEG and SVG files and copies every other image
/// unchanged, preserving paths. Returns once every file has been written.
pub async fn optimize_images(root: &Path, config: &ImagesConfig) -> Result<usize> {
    let files = config.src.resolve(root)?;
    let dest = root.join(&config.dest);

    let mut saved: u64 = 0;
    for file in &files {
        let contents = tokio::fs::read(&file.path).await?;
        let original_len = contents.len();

        let output = match ImageKind::of(&file.path) {
            ImageKind::Other => contents,
            kind => {
                let path = file.path.display().to_string();
                let (level, quality) = (config.level, config.jpeg_quality);
                blocking(move || match kind {
                    ImageKind::Png => optimize_png(&path, &contents, level),
                    ImageKind::Jpeg => optimize_jpeg(&path, &contents, quality),
                    _ => Ok(optimize_svg(&path, &contents)),
                })
                .await?
            }
        };

        saved += original_len.saturating_sub(output.len()) as u64;
        write_output(&dest.join(&file.relative), &output).await?;
        debug!("Optimized {}", file.path.display());
    }

    info!("Processed {} image(s), saved {} bytes", files.len(), saved);
    Ok(files.len())
}

/// Every file a run over `config` writes.
pub fn outputs(root: &Path, config: &ImagesConfig) -> Result<Vec<PathBuf>> {
    let dest = root.join(&config.dest);
    Ok(config
        .src
        .resolve(root)?
        .into_iter()
        .map(|file| dest.join(file.relative))
        .collect())
}

/// Never replaces an image with a larger encoding.
fn smaller(optimized: Vec<u8>, original: &[u8]) -> Vec<u8> {
    if optimized.len() < original.len() {
        optimized
    } else {
        original.to_vec()
    }
}

pub fn optimize_png(path: &str, contents: &[u8], level: u8) -> Result<Vec<u8>> {
    let options = oxipng::Options::from_preset(level);

    let optimized = oxipng::optimize_from_memory(contents, &options).map_err(|e| PipelineError::Image {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    Ok(smaller(optimized, contents))
}

/// Re-encodes a JPEG at `quality`. Lossy; grayscale images stay grayscale.
pub fn optimize_jpeg(path: &str, contents: &[u8], quality: u8) -> Result<Vec<u8>> {
    let image_error = |message: String| PipelineError::Image {
        path: path.to_string(),
        message,
    };

    let decoded = image::load_from_memory_with_format(contents, ImageFormat::Jpeg)
        .map_err(|e| image_error(e.to_string()))?;

    let mut optimized = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut optimized, quality);
        match decoded.color() {
            ColorType::L8 | ColorType::L16 => encoder.encode_image(&decoded.to_luma8()),
            _ => encoder.encode_image(&decoded.to_rgb8()),
        }
        .map_err(|e| image_error(e.to_string()))?;
    }

    Ok(smaller(optimized, contents))
}

/// Re-serializes an SVG through usvg, which drops comments, metadata,
/// editor attributes and whitespace. Documents with text, or that usvg
/// cannot model, are kept as they are.
pub fn optimize_svg(path: &str, contents: &[u8]) -> Vec<u8> {
    // Re-serialization would outline text with whatever fonts are loaded.
    if contents.windows(5).any(|w| w == b"<text") {
        debug!("{} contains text, copied unchanged", path);
        return contents.to_vec();
    }

    let tree = match usvg::Tree::from_data(contents, &usvg::Options::default()) {
        Ok(tree) => tree,
        Err(e) => {
            debug!("{} not optimized: {}", path, e);
            return contents.to_vec();
        }
    };

    let options = usvg::WriteOptions {
        indent: usvg::Indent::None,
        attributes_indent: usvg::Indent::None,
        ..usvg::WriteOptions::default()
    };

    smaller(tree.to_string(&options).into_bytes(), contents)
}
