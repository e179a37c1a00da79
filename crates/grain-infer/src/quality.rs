//! Trade grading from final counts and the length/width ratio.

use crate::postprocess::Prediction;
use grain_model::{CountCategory, GrainType, MeasureKind};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MillingGrade {
    Premium,
    Grade1,
    Grade2,
    Grade3,
    BelowGrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GrainShape {
    Bold,
    Medium,
    Slender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LengthClass {
    Long,
    Medium,
    Short,
    Mixed,
}

/// Defect findings; a category only appears when over its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Defect {
    Chalky,
    /// Black grains.
    Damaged,
    /// Green grains.
    Immature,
    RedStrips,
    /// Yellow grains in milled rice.
    Fermented,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub milling_grade: MillingGrade,
    pub shape: GrainShape,
    pub length_class: LengthClass,
    pub broken_pct: f32,
    pub chalky_pct: f32,
    pub defects: Vec<Defect>,
}

impl QualityReport {
    pub fn from_prediction(prediction: &Prediction, grain: GrainType) -> Self {
        let total = prediction.count(CountCategory::Total).max(1) as f32;
        let pct = |c: CountCategory| prediction.count(c) as f32 * 100.0 / total;

        let broken_pct = pct(CountCategory::Broken);
        let long_pct = pct(CountCategory::Long);
        let medium_pct = pct(CountCategory::Medium);
        let short_pct = 100.0 - long_pct - medium_pct;
        let chalky_pct = pct(CountCategory::Chalky);

        let milling_grade = match broken_pct {
            p if p < 5.0 => MillingGrade::Premium,
            p if p <= 10.0 => MillingGrade::Grade1,
            p if p <= 15.0 => MillingGrade::Grade2,
            p if p <= 20.0 => MillingGrade::Grade3,
            _ => MillingGrade::BelowGrade,
        };
        let lw = prediction.measure(MeasureKind::LwRatioAverage);
        let shape = if lw < 2.1 {
            GrainShape::Bold
        } else if lw <= 2.9 {
            GrainShape::Medium
        } else {
            GrainShape::Slender
        };
        let length_class = if long_pct > 90.0 {
            LengthClass::Long
        } else if medium_pct > 90.0 {
            LengthClass::Medium
        } else if short_pct > 90.0 {
            LengthClass::Short
        } else {
            LengthClass::Mixed
        };

        let mut defects = Vec::new();
        if chalky_pct >= 20.0 {
            defects.push(Defect::Chalky);
        }
        if pct(CountCategory::Black) > 10.0 {
            defects.push(Defect::Damaged);
        }
        if pct(CountCategory::Green) > 10.0 {
            defects.push(Defect::Immature);
        }
        if pct(CountCategory::Red) > 10.0 {
            defects.push(Defect::RedStrips);
        }
        if grain != GrainType::Paddy && pct(CountCategory::Yellow) > 10.0 {
            defects.push(Defect::Fermented);
        }

        Self { milling_grade, shape, length_class, broken_pct, chalky_pct, defects }
    }

    pub fn has(&self, defect: Defect) -> bool {
        self.defects.contains(&defect)
    }
}

impl fmt::Display for MillingGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MillingGrade::Premium => "Premium",
            MillingGrade::Grade1 => "Grade 1",
            MillingGrade::Grade2 => "Grade 2",
            MillingGrade::Grade3 => "Grade 3",
            MillingGrade::BelowGrade => "Below Grade",
        })
    }
}

impl fmt::Display for QualityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.1}% broken), {:?} shape, {:?} length",
            self.milling_grade, self.broken_pct, self.shape, self.length_class
        )?;
        if !self.defects.is_empty() {
            write!(f, ", defects: {:?}", self.defects)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(counts: [u32; 9], lw: f32) -> Prediction {
        let mut measures = [0.0; 6];
        measures[MeasureKind::LwRatioAverage.index()] = lw;
        Prediction { counts, measures }
    }

    #[test]
    fn milling_grade_boundaries() {
        let grade = |broken| QualityReport::from_prediction(&prediction([100, broken, 0, 0, 0, 0, 0, 0, 0], 3.0), GrainType::White).milling_grade;
        assert_eq!(grade(4), MillingGrade::Premium);
        assert_eq!(grade(5), MillingGrade::Grade1);
        assert_eq!(grade(10), MillingGrade::Grade1);
        assert_eq!(grade(15), MillingGrade::Grade2);
        assert_eq!(grade(20), MillingGrade::Grade3);
        assert_eq!(grade(21), MillingGrade::BelowGrade);
    }

    #[test]
    fn shape_from_lw_ratio() {
        let shape = |lw| QualityReport::from_prediction(&prediction([10; 9], lw), GrainType::White).shape;
        assert_eq!(shape(2.0), GrainShape::Bold);
        assert_eq!(shape(2.1), GrainShape::Medium);
        assert_eq!(shape(2.9), GrainShape::Medium);
        assert_eq!(shape(3.2), GrainShape::Slender);
    }

    #[test]
    fn length_class_uses_remainder_for_short() {
        let class = |long, medium| {
            QualityReport::from_prediction(&prediction([100, 0, long, medium, 0, 0, 0, 0, 0], 3.0), GrainType::White)
                .length_class
        };
        assert_eq!(class(95, 0), LengthClass::Long);
        assert_eq!(class(0, 91), LengthClass::Medium);
        assert_eq!(class(3, 4), LengthClass::Short);
        assert_eq!(class(50, 40), LengthClass::Mixed);
    }

    #[test]
    fn defects_and_paddy_yellow_exemption() {
        let counts = [100, 0, 0, 0, 11, 20, 11, 11, 11];
        let white = QualityReport::from_prediction(&prediction(counts, 3.0), GrainType::White);
        for d in [Defect::Chalky, Defect::Damaged, Defect::Immature, Defect::RedStrips, Defect::Fermented] {
            assert!(white.has(d), "{d:?}");
        }
        let paddy = QualityReport::from_prediction(&prediction(counts, 3.0), GrainType::Paddy);
        assert!(!paddy.has(Defect::Fermented));
    }

    #[test]
    fn zero_total_does_not_divide_by_zero() {
        let r = QualityReport::from_prediction(&prediction([0; 9], 2.5), GrainType::Brown);
        assert_eq!(r.milling_grade, MillingGrade::Premium);
        assert_eq!(r.length_class, LengthClass::Short);
        assert!(r.defects.is_empty());
        assert!(r.to_string().starts_with("Premium"));
    }
}
