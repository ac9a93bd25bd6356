use geo::{Coord, MultiPoint, Point};
use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use ndarray::{Array3, ArrayView2, Axis};
use tracing::instrument;

/// Side lengths of the detector canvas are rounded up to this multiple.
const CANVAS_ALIGN: u32 = 32;

#[instrument(level = "debug", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

/// Marks every cell strictly above `threshold` with 255.
pub(crate) fn binarize(data: ArrayView2<f32>, threshold: f32) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        if data[[y as usize, x as usize]] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

pub(crate) fn to_multi_point(points: &[(u32, u32)]) -> MultiPoint<f32> {
    points
        .iter()
        .map(|&(x, y)| Point::new(x as f32, y as f32))
        .collect::<Vec<_>>()
        .into()
}

pub(crate) fn distance(a: Coord<f32>, b: Coord<f32>) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Puts four corners in clockwise order (image space) starting at the corner
/// with the smallest `x + y`.
pub(crate) fn clockwise_from_top_left(mut corners: [Coord<f32>; 4]) -> [Coord<f32>; 4] {
    let signed_area: f32 = (0..4)
        .map(|i| {
            let (a, b) = (corners[i], corners[(i + 1) % 4]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    if signed_area < 0.0 {
        corners.reverse();
    }
    let start = (0..4)
        .min_by(|&a, &b| {
            let sa = corners[a].x + corners[a].y;
            let sb = corners[b].x + corners[b].y;
            sa.total_cmp(&sb)
        })
        .unwrap_or(0);
    corners.rotate_left(start);
    corners
}

/// Resize plan for the detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    /// Resized size over original size (same on both axes).
    pub ratio: f32,
    pub target_width: u32,
    pub target_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

/// Scales the long side to `mag_ratio` times itself, capped at `canvas_size`,
/// and rounds the canvas up to a multiple of 32.
pub fn scale_aspect(width: u32, height: u32, canvas_size: u32, mag_ratio: f32) -> Scale {
    let long_side = width.max(height).max(1) as f32;
    let target_size = (mag_ratio * long_side).min(canvas_size as f32);
    let ratio = target_size / long_side;
    let target_width = ((width as f32 * ratio) as u32).max(1);
    let target_height = ((height as f32 * ratio) as u32).max(1);
    let canvas_width = target_width.div_ceil(CANVAS_ALIGN) * CANVAS_ALIGN;
    let canvas_height = target_height.div_ceil(CANVAS_ALIGN) * CANVAS_ALIGN;
    log::debug!("Resize will change image dimensions from (w: {width}, h: {height}) to (w: {target_width}, h: {target_height}) on a {canvas_width}x{canvas_height} canvas with ratio {ratio}.");
    Scale {
        ratio,
        target_width,
        target_height,
        canvas_width,
        canvas_height,
    }
}

/// Resizes `image` per `scale` and pastes it at the origin of a black canvas.
#[instrument(level = "debug", skip(image))]
pub(crate) fn resize_to_canvas(image: &DynamicImage, scale: &Scale) -> DynamicImage {
    let resized = imageops::resize(
        &image.to_rgb8(),
        scale.target_width,
        scale.target_height,
        imageops::FilterType::Triangle,
    );
    let mut canvas = RgbImage::new(scale.canvas_width, scale.canvas_height);
    imageops::replace(&mut canvas, &resized, 0, 0);
    DynamicImage::ImageRgb8(canvas)
}
