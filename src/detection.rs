use std::collections::BTreeMap;

use geo::{Area, Coord, MinimumRotatedRect};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use imageproc::{
    distance_transform::Norm,
    morphology::dilate,
    region_labelling::{connected_components, Connectivity},
};
use ndarray::{s, Array2, ArrayD, ArrayView2, Axis, Ix4};
use tracing::instrument;

use crate::{
    ctc::DecodeError,
    inference::InferencePort,
    util::{
        self, binarize, clockwise_from_top_left, distance, resize_to_canvas, scale_aspect,
        subtract_mean_normalize, to_multi_point,
    },
    Result, TextBox,
};

const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

/// Rectangles whose sides differ by at most this fraction are replaced by
/// their axis-aligned bounds.
const SQUARE_TOLERANCE: f32 = 0.1;
const MIN_BOX_AREA: f32 = 1.0;
const GRID_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionOptions {
    pub canvas_size: u32,
    pub mag_ratio: f32,
    /// A component needs at least one text score at or above this.
    pub text_threshold: f32,
    pub link_threshold: f32,
    /// Text scores above this make up candidate regions.
    pub low_text: f32,
    pub min_component_area: u32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            canvas_size: 640,
            mag_ratio: 1.5,
            text_threshold: 0.7,
            link_threshold: 0.4,
            low_text: 0.4,
            min_component_area: 10,
        }
    }
}

/// Text and link score maps produced jointly by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMaps {
    pub text: Array2<f32>,
    pub link: Array2<f32>,
}

impl ScoreMaps {
    /// Splits a `(1, H, W, 2)` detector output.
    pub fn from_output(output: ArrayD<f32>) -> Result<Self, DecodeError> {
        let shape = output.shape().to_vec();
        let output = output
            .into_dimensionality::<Ix4>()
            .map_err(|_| DecodeError::InvalidShape(shape.clone()))?;
        if output.len_of(Axis(0)) != 1 || output.len_of(Axis(3)) != 2 {
            return Err(DecodeError::InvalidShape(shape));
        }
        Ok(Self {
            text: output.slice(s![0, .., .., 0]).to_owned(),
            link: output.slice(s![0, .., .., 1]).to_owned(),
        })
    }

    /// Canvas pixels per map cell.
    fn stride(&self, scale: &util::Scale) -> f32 {
        let (height, width) = self.text.dim();
        if width == 0 || height == 0 {
            return 1.0;
        }
        let stride_x = scale.canvas_width as f32 / width as f32;
        let stride_y = scale.canvas_height as f32 / height as f32;
        (stride_x + stride_y) / 2.0
    }
}

pub struct Detector {
    model: String,
    options: DetectionOptions,
}

impl Detector {
    pub fn new(model: impl Into<String>, options: DetectionOptions) -> Self {
        Self {
            model: model.into(),
            options,
        }
    }

    #[instrument(skip(self, port, image), level = "debug")]
    pub async fn detect<P: InferencePort + ?Sized>(
        &self,
        port: &P,
        image: &DynamicImage,
    ) -> Result<Vec<TextBox>> {
        let scale = scale_aspect(
            image.width(),
            image.height(),
            self.options.canvas_size,
            self.options.mag_ratio,
        );
        let canvas = resize_to_canvas(image, &scale);
        let input = subtract_mean_normalize(&canvas, &MEAN_VALUES, &NORM_VALUES)
            .insert_axis(Axis(0))
            .into_dyn();

        let output = port.infer(&self.model, input).await?;
        log::trace!("Detector output size: {:?}", output.shape());
        let maps = ScoreMaps::from_output(output)?;
        let factor = maps.stride(&scale) / scale.ratio;

        let options = self.options;
        let boxes = tokio::task::spawn_blocking(move || {
            extract_boxes(maps.text.view(), maps.link.view(), &options, factor)
        })
        .await?;
        log::debug!("Detected {} text boxes", boxes.len());
        Ok(boxes)
    }
}

#[derive(Debug, Clone, Copy)]
struct Component {
    label: u32,
    area: u32,
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
    max_score: f32,
}

impl Component {
    fn width(&self) -> u32 {
        self.right - self.left + 1
    }

    fn height(&self) -> u32 {
        self.bottom - self.top + 1
    }
}

/// Turns a text/link score map pair into oriented boxes, in the order the
/// components are found (raster order of their first pixel). Vertices are
/// multiplied by `scale` to reach original-image coordinates.
#[instrument(level = "debug", skip(text_map, link_map))]
pub fn extract_boxes(
    text_map: ArrayView2<f32>,
    link_map: ArrayView2<f32>,
    options: &DetectionOptions,
    scale: f32,
) -> Vec<TextBox> {
    let (height, width) = text_map.dim();
    if width == 0 || height == 0 || link_map.dim() != (height, width) {
        return Vec::new();
    }

    let text_mask = binarize(text_map, options.low_text);
    let link_mask = binarize(link_map, options.link_threshold);
    let combined: GrayImage = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Luma([text_mask.get_pixel(x, y)[0] | link_mask.get_pixel(x, y)[0]])
    });
    let labels = connected_components(&combined, Connectivity::Four, Luma([0u8]));

    let mut components = BTreeMap::<u32, Component>::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        let score = text_map[[y as usize, x as usize]];
        components
            .entry(label)
            .and_modify(|c| {
                c.area += 1;
                c.left = c.left.min(x);
                c.right = c.right.max(x);
                c.top = c.top.min(y);
                c.bottom = c.bottom.max(y);
                c.max_score = c.max_score.max(score);
            })
            .or_insert(Component {
                label,
                area: 1,
                left: x,
                top: y,
                right: x,
                bottom: y,
                max_score: score,
            });
    }

    let mut ordered = components.into_values().collect::<Vec<_>>();
    ordered.sort_by_key(|c| (c.top, first_pixel_column(&labels, c)));

    ordered
        .into_iter()
        .filter(|c| c.area >= options.min_component_area)
        .filter(|c| c.max_score >= options.text_threshold)
        .filter_map(|c| component_box(&c, &labels, &text_mask, &link_mask))
        .map(|(corners, score)| TextBox::new(corners.map(|p| p * scale), score))
        .collect()
}

fn snap_to_grid(value: f32) -> f32 {
    let rounded = value.round();
    if (value - rounded).abs() <= GRID_EPSILON {
        rounded
    } else {
        value
    }
}

fn first_pixel_column(labels: &ImageBuffer<Luma<u32>, Vec<u32>>, component: &Component) -> u32 {
    (component.left..=component.right)
        .find(|&x| labels.get_pixel(x, component.top)[0] == component.label)
        .unwrap_or(component.left)
}

#[instrument(level = "trace", skip(labels, text_mask, link_mask))]
fn component_box(
    component: &Component,
    labels: &ImageBuffer<Luma<u32>, Vec<u32>>,
    text_mask: &GrayImage,
    link_mask: &GrayImage,
) -> Option<([Coord<f32>; 4], f32)> {
    let (width, height) = labels.dimensions();
    let (w, h) = (component.width(), component.height());
    let niter =
        ((component.area as f32 * w.min(h) as f32 / (w * h) as f32).sqrt() * 2.0) as u32;
    let sx = component.left.saturating_sub(niter);
    let sy = component.top.saturating_sub(niter);
    let ex = (component.left + w + niter + 1).min(width);
    let ey = (component.top + h + niter + 1).min(height);

    // component pixels minus link-only pixels
    let segment: GrayImage = ImageBuffer::from_fn(ex - sx, ey - sy, |x, y| {
        let (gx, gy) = (x + sx, y + sy);
        let link_only = link_mask.get_pixel(gx, gy)[0] > 0 && text_mask.get_pixel(gx, gy)[0] == 0;
        if labels.get_pixel(gx, gy)[0] == component.label && !link_only {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let radius = niter.div_ceil(2).min(u8::MAX as u32) as u8;
    let segment = if radius > 0 {
        dilate(&segment, Norm::LInf, radius)
    } else {
        segment
    };

    let points = segment
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| (x + sx, y + sy))
        .collect::<Vec<_>>();
    if points.len() < 3 {
        return None;
    }

    let rect = to_multi_point(&points).minimum_rotated_rect()?;
    if rect.unsigned_area() < MIN_BOX_AREA {
        log::trace!("Dropping degenerate component {}", component.label);
        return None;
    }
    let ring = &rect.exterior().0;
    if ring.len() < 4 {
        return None;
    }
    // rotation leaves float noise on axis-aligned rectangles
    let (max_x, max_y) = (width as f32, height as f32);
    let mut corners = [ring[0], ring[1], ring[2], ring[3]].map(|c| Coord {
        x: snap_to_grid(c.x).clamp(0.0, max_x),
        y: snap_to_grid(c.y).clamp(0.0, max_y),
    });

    let side_a = distance(corners[0], corners[1]);
    let side_b = distance(corners[1], corners[2]);
    let box_ratio = side_a.max(side_b) / (side_a.min(side_b) + 1e-5);
    if (1.0 - box_ratio).abs() <= SQUARE_TOLERANCE {
        let (mut l, mut t, mut r, mut b) = (u32::MAX, u32::MAX, 0, 0);
        for &(x, y) in &points {
            l = l.min(x);
            r = r.max(x);
            t = t.min(y);
            b = b.max(y);
        }
        let (l, t, r, b) = (l as f32, t as f32, r as f32, b as f32);
        corners = [
            Coord { x: l, y: t },
            Coord { x: r, y: t },
            Coord { x: r, y: b },
            Coord { x: l, y: b },
        ];
    }

    Some((clockwise_from_top_left(corners), component.max_score))
}
