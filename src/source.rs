use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Light emission profile of a track segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum SourceShape {
    /// Minimum-ionizing muon track segment
    ContinuousTrack,
    /// Point-like cascade
    Stochastic,
}

/// Energy deposition hypothesis along a reconstructed track
///
/// Position, direction and time are fixed by the caller, only `energy` is written by the
/// unfolding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Source {
    pub position: [f64; 3],
    pub direction: [f64; 3],
    pub time: f64,
    pub shape: SourceShape,
    pub energy: f64,
}

impl Source {
    pub fn new(position: [f64; 3], direction: [f64; 3], time: f64, shape: SourceShape) -> Self {
        Self {
            position,
            direction,
            time,
            shape,
            energy: 0.0,
        }
    }

    #[inline]
    pub fn is_track(&self) -> bool {
        self.shape == SourceShape::ContinuousTrack
    }
}
