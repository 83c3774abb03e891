use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Ordering applied to the slices of a series before they are stacked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Position along the slice normal (ImagePositionPatient projected
    /// onto the cross product of the ImageOrientationPatient cosines).
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// Segmentation engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    #[default]
    Skellytour,
    TotalSegmentator,
}

/// Compute device handed to Skellytour.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    #[default]
    Gpu,
    Cpu,
}

/// Resting and in-flight stages of a pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Idle,
    Converting,
    Converted,
    Segmenting,
    Done,
}

impl Stage {
    /// Whether a background worker owns this stage.
    pub fn is_busy(self) -> bool {
        matches!(self, Stage::Converting | Stage::Segmenting)
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind} '{value}', expected one of: {expected}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
    expected: &'static str,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Skellytour => "Skellytour",
            Method::TotalSegmentator => "TotalSegmentator",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skellytour" => Ok(Method::Skellytour),
            "totalsegmentator" => Ok(Method::TotalSegmentator),
            _ => Err(ParseEnumError {
                kind: "method",
                value: s.to_string(),
                expected: "skellytour, totalsegmentator",
            }),
        }
    }
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Gpu => "gpu",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(Device::Gpu),
            "cpu" => Ok(Device::Cpu),
            _ => Err(ParseEnumError {
                kind: "device",
                value: s.to_string(),
                expected: "gpu, cpu",
            }),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Converting => "converting",
            Stage::Converted => "converted",
            Stage::Segmenting => "segmenting",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}
