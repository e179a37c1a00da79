//! Output categories and the grain-type conditioning signal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The nine count heads, in output-column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CountCategory {
    #[serde(rename = "Count")]
    Total,
    #[serde(rename = "Broken_Count")]
    Broken,
    #[serde(rename = "Long_Count")]
    Long,
    #[serde(rename = "Medium_Count")]
    Medium,
    #[serde(rename = "Black_Count")]
    Black,
    #[serde(rename = "Chalky_Count")]
    Chalky,
    #[serde(rename = "Red_Count")]
    Red,
    #[serde(rename = "Yellow_Count")]
    Yellow,
    #[serde(rename = "Green_Count")]
    Green,
}

impl CountCategory {
    pub const COUNT: usize = 9;

    pub const ALL: [CountCategory; Self::COUNT] = [
        CountCategory::Total,
        CountCategory::Broken,
        CountCategory::Long,
        CountCategory::Medium,
        CountCategory::Black,
        CountCategory::Chalky,
        CountCategory::Red,
        CountCategory::Yellow,
        CountCategory::Green,
    ];

    /// Position in the count vector (and `count_heads.{i}` in the artifact).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn column(self) -> &'static str {
        match self {
            CountCategory::Total => "Count",
            CountCategory::Broken => "Broken_Count",
            CountCategory::Long => "Long_Count",
            CountCategory::Medium => "Medium_Count",
            CountCategory::Black => "Black_Count",
            CountCategory::Chalky => "Chalky_Count",
            CountCategory::Red => "Red_Count",
            CountCategory::Yellow => "Yellow_Count",
            CountCategory::Green => "Green_Count",
        }
    }

    pub fn columns() -> [&'static str; Self::COUNT] {
        Self::ALL.map(Self::column)
    }
}

/// The six regressed measurements, in output-column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureKind {
    LengthAverage,
    WidthAverage,
    LwRatioAverage,
    ColorL,
    ColorA,
    ColorB,
}

impl MeasureKind {
    pub const COUNT: usize = 6;

    pub const ALL: [MeasureKind; Self::COUNT] = [
        MeasureKind::LengthAverage,
        MeasureKind::WidthAverage,
        MeasureKind::LwRatioAverage,
        MeasureKind::ColorL,
        MeasureKind::ColorA,
        MeasureKind::ColorB,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn column(self) -> &'static str {
        match self {
            MeasureKind::LengthAverage => "WK_Length_Average",
            MeasureKind::WidthAverage => "WK_Width_Average",
            MeasureKind::LwRatioAverage => "WK_LW_Ratio_Average",
            MeasureKind::ColorL => "Average_L",
            MeasureKind::ColorA => "Average_a",
            MeasureKind::ColorB => "Average_b",
        }
    }

    pub fn columns() -> [&'static str; Self::COUNT] {
        Self::ALL.map(Self::column)
    }
}

/// Grain type of a sample. Selects the meta one-hot and the structural zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GrainType {
    #[default]
    Paddy,
    White,
    Brown,
}

impl GrainType {
    pub const ALL: [GrainType; 3] = [GrainType::Paddy, GrainType::White, GrainType::Brown];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Lenient parse used for manifest labels: unknown labels become
    /// `Paddy` and are reported once per call.
    pub fn from_label(label: &str) -> Self {
        match label.parse() {
            Ok(grain) => grain,
            Err(UnknownGrainType(raw)) => {
                log::warn!("unknown grain type {raw:?}, falling back to Paddy");
                GrainType::Paddy
            }
        }
    }

    /// Exactly one element is 1.0.
    pub fn one_hot(self) -> [f32; 3] {
        let mut v = [0.0; 3];
        v[self.index()] = 1.0;
        v
    }
}

impl fmt::Display for GrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GrainType::Paddy => "Paddy",
            GrainType::White => "White",
            GrainType::Brown => "Brown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownGrainType(pub String);

impl fmt::Display for UnknownGrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown grain type {:?}", self.0)
    }
}

impl std::error::Error for UnknownGrainType {}

impl FromStr for GrainType {
    type Err = UnknownGrainType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        GrainType::ALL
            .into_iter()
            .find(|g| g.to_string().eq_ignore_ascii_case(label))
            .ok_or_else(|| UnknownGrainType(label.to_string()))
    }
}
