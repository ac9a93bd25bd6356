use geo::{Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};

/// An oriented quadrilateral around one word or line, in original-image coordinates.
///
/// Vertices run clockwise (in image space, y pointing down) starting from the
/// top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBox {
    pub score: f32,
    pub rect: Polygon<f32>,
}

impl TextBox {
    pub fn new(corners: [Coord<f32>; 4], score: f32) -> Self {
        Self {
            score,
            rect: Polygon::new(LineString::from(corners.to_vec()), vec![]),
        }
    }

    pub fn corners(&self) -> [Coord<f32>; 4] {
        let coords = &self.rect.exterior().0;
        [coords[0], coords[1], coords[2], coords[3]]
    }

    /// `[x0, y0, x1, y1, x2, y2, x3, y3]`
    pub fn to_flat(&self) -> Vec<f32> {
        self.corners().iter().flat_map(|c| [c.x, c.y]).collect()
    }
}

/// Output of the sequence decoder for one crop.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedText {
    pub text: String,
    pub confidence: f32,
    /// Max probability of every non-blank time step, before repeats are collapsed.
    pub character_scores: Vec<f32>,
}

impl DecodedText {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            character_scores: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoxResult {
    pub bounds: TextBox,
    pub text: DecodedText,
}

/// Final result of one recognition request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
    /// Boxes that passed the acceptance threshold, in detection order.
    pub boxes: Vec<BoxResult>,
}

/// One accepted box as it is persisted and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: Vec<f32>,
    pub text: String,
    pub score: f32,
}

impl From<&BoxResult> for Detection {
    fn from(result: &BoxResult) -> Self {
        Self {
            bbox: result.bounds.to_flat(),
            text: result.text.text.clone(),
            score: result.text.confidence,
        }
    }
}
