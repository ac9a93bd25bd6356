use geo::Coord;
use image::{imageops::FilterType, GrayImage, ImageBuffer, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use ndarray::Array4;
use thiserror::Error;
use tracing::instrument;

use crate::{util::distance, TextBox};

const AXIS_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CropError {
    #[error("text box lies outside the image")]
    EmptyRegion,
    #[error("text box corners do not span a quadrilateral")]
    DegenerateQuad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropOptions {
    pub model_height: u32,
    pub max_width: u32,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            model_height: 64,
            max_width: 2048,
        }
    }
}

/// A horizontal grey strip `model_height` pixels high, right-padded to a
/// whole number of `model_height` wide cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Crop {
    pub image: GrayImage,
    /// Width of the scaled text before padding.
    pub content_width: u32,
}

impl Crop {
    /// `(1, 1, H, W)` tensor with values in `[0, 1]`.
    pub fn to_tensor(&self) -> Array4<f32> {
        let (width, height) = self.image.dimensions();
        Array4::from_shape_fn((1, 1, height as usize, width as usize), |(_, _, y, x)| {
            self.image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
        })
    }

    /// Stretches low-contrast crops so the gap between the 10th and 90th
    /// percentile grey levels covers most of the range. Crops already at or
    /// above `target` contrast are returned unchanged.
    pub fn with_contrast(&self, target: f32) -> Crop {
        let mut values = self.image.as_raw().clone();
        if values.is_empty() {
            return self.clone();
        }
        values.sort_unstable();
        let high = percentile(&values, 0.9);
        let low = percentile(&values, 0.1);
        let contrast = (high - low) / (high + low).max(10.0);
        if contrast >= target {
            return self.clone();
        }

        let ratio = 200.0 / (high - low).max(10.0);
        let mut image = self.image.clone();
        for pixel in image.pixels_mut() {
            let value = (pixel[0] as f32 - low + 25.0) * ratio;
            pixel[0] = value.clamp(0.0, 255.0) as u8;
        }
        log::trace!("Stretched crop contrast {contrast} (p10 {low}, p90 {high})");
        Crop {
            image,
            content_width: self.content_width,
        }
    }
}

/// Linear-interpolated percentile of sorted values.
fn percentile(sorted: &[u8], q: f32) -> f32 {
    let rank = q * (sorted.len() - 1) as f32;
    let below = rank.floor() as usize;
    let above = rank.ceil() as usize;
    let weight = rank - below as f32;
    sorted[below] as f32 * (1.0 - weight) + sorted[above] as f32 * weight
}

fn is_axis_aligned(corners: &[Coord<f32>; 4]) -> bool {
    let close = |a: f32, b: f32| (a - b).abs() <= AXIS_TOLERANCE;
    close(corners[0].y, corners[1].y)
        && close(corners[1].x, corners[2].x)
        && close(corners[2].y, corners[3].y)
        && close(corners[3].x, corners[0].x)
}

/// Cuts the box out of `image` and brings it to recognizer geometry.
#[instrument(level = "trace", skip(image))]
pub fn crop_text_box(
    text_box: &TextBox,
    image: &GrayImage,
    options: &CropOptions,
) -> Result<Crop, CropError> {
    let corners = text_box.corners();
    let region = if is_axis_aligned(&corners) {
        cut_axis_aligned(&corners, image)?
    } else {
        warp_quad(&corners, image)?
    };
    Ok(fit_to_height(&region, options))
}

fn cut_axis_aligned(corners: &[Coord<f32>; 4], image: &GrayImage) -> Result<GrayImage, CropError> {
    let (width, height) = image.dimensions();
    let min_x = corners.iter().map(|c| c.x).fold(f32::INFINITY, f32::min);
    let max_x = corners.iter().map(|c| c.x).fold(f32::NEG_INFINITY, f32::max);
    let min_y = corners.iter().map(|c| c.y).fold(f32::INFINITY, f32::min);
    let max_y = corners.iter().map(|c| c.y).fold(f32::NEG_INFINITY, f32::max);

    let left = (min_x.floor().max(0.0) as u32).min(width);
    let top = (min_y.floor().max(0.0) as u32).min(height);
    let right = (max_x.ceil().max(0.0) as u32).min(width);
    let bottom = (max_y.ceil().max(0.0) as u32).min(height);
    if right <= left || bottom <= top {
        return Err(CropError::EmptyRegion);
    }
    log::trace!("Slicing subimage to ({left}, {top})-({right}, {bottom})");
    Ok(image::imageops::crop_imm(image, left, top, right - left, bottom - top).to_image())
}

fn warp_quad(corners: &[Coord<f32>; 4], image: &GrayImage) -> Result<GrayImage, CropError> {
    let [tl, tr, br, bl] = *corners;
    let width = distance(tl, tr).max(distance(bl, br)).round() as u32;
    let height = distance(tl, bl).max(distance(tr, br)).round() as u32;
    if width < 2 || height < 2 {
        return Err(CropError::DegenerateQuad);
    }
    let (w, h) = ((width - 1) as f32, (height - 1) as f32);
    let projection = Projection::from_control_points(
        [(tl.x, tl.y), (tr.x, tr.y), (br.x, br.y), (bl.x, bl.y)],
        [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)],
    )
    .ok_or(CropError::DegenerateQuad)?;

    let mut out = GrayImage::new(width, height);
    warp_into(image, &projection, Interpolation::Bilinear, Luma([0]), &mut out);
    Ok(out)
}

fn fit_to_height(region: &GrayImage, options: &CropOptions) -> Crop {
    let (width, height) = region.dimensions();
    let model_height = options.model_height.max(1);
    let scaled_width = (width as f32 * model_height as f32 / height as f32).round() as u32;
    let content_width = scaled_width.clamp(1, options.max_width.max(1));
    let resized = image::imageops::resize(region, content_width, model_height, FilterType::Lanczos3);

    let bucket = content_width
        .div_ceil(model_height)
        .saturating_mul(model_height)
        .min(options.max_width.max(content_width));
    let image = if bucket == content_width {
        resized
    } else {
        ImageBuffer::from_fn(bucket, model_height, |x, y| {
            *resized.get_pixel(x.min(content_width - 1), y)
        })
    };
    Crop {
        image,
        content_width,
    }
}
