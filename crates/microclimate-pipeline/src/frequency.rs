//! Reduce a label map to per-class area fractions.

use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::classes::{LandCover, NUM_CLASSES, NUM_SUBSTANTIVE};
use crate::types::LabelMap;

/// Exact per-class pixel counts of a label map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassHistogram {
    counts: [u64; NUM_CLASSES],
    total: u64,
}

impl ClassHistogram {
    /// Count every class in `labels`.
    #[must_use]
    pub fn from_label_map(labels: &LabelMap) -> Self {
        let mut counts = [0_u64; NUM_CLASSES];
        for &id in labels.as_raw() {
            // LabelMap guarantees registered ids.
            if let Some(slot) = counts.get_mut(usize::from(id)) {
                *slot += 1;
            }
        }
        Self {
            counts,
            total: labels.pixel_count() as u64,
        }
    }

    /// Pixels labeled `class`.
    #[must_use]
    pub const fn count(&self, class: LandCover) -> u64 {
        self.counts[class.index()]
    }

    /// Total pixels, background included.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Area fraction of each substantive class, relative to the total
    /// pixel count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn frequencies(&self) -> ClassFrequencies {
        let total = self.total as f64;
        ClassFrequencies(std::array::from_fn(|i| {
            self.count(LandCover::SUBSTANTIVE[i]) as f64 / total
        }))
    }
}

/// Area fraction per substantive class, in ascending class-id order
/// (background excluded).
///
/// Serializes as a bare array of eight numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassFrequencies(pub [f64; NUM_SUBSTANTIVE]);

impl ClassFrequencies {
    /// The fraction for a substantive class; `None` for background.
    #[must_use]
    pub fn get(&self, class: LandCover) -> Option<f64> {
        if class.is_background() {
            None
        } else {
            Some(self.0[class.index() - 1])
        }
    }

    /// Pairs of (class, fraction) in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (LandCover, f64)> + '_ {
        LandCover::SUBSTANTIVE.into_iter().zip(self.0.iter().copied())
    }

    /// Every entry rounded half-to-even to `decimals` places.
    #[must_use]
    pub fn rounded(&self, decimals: i32) -> Self {
        Self(self.0.map(|v| round_to(v, decimals)))
    }

    /// The raw fractions.
    #[must_use]
    pub const fn as_array(&self) -> &[f64; NUM_SUBSTANTIVE] {
        &self.0
    }
}

impl Index<usize> for ClassFrequencies {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

/// Round `value` to `decimals` places, ties to even (`0.125` to two
/// places is `0.12`).
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// Area fraction of each substantive class in `labels`.
///
/// Denominator is the full pixel count, background included, so the
/// entries need not sum to one.
#[must_use]
pub fn frequencies(labels: &LabelMap) -> ClassFrequencies {
    ClassHistogram::from_label_map(labels).frequencies()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn half_road_half_background() {
        let labels = LabelMap::from_fn(4, 4, |x, _| {
            if x < 2 {
                LandCover::Road
            } else {
                LandCover::Background
            }
        })
        .unwrap();
        let freq = frequencies(&labels);
        assert_eq!(freq.as_array().len(), 8);
        for (class, value) in freq.iter() {
            if class == LandCover::Road {
                assert!((value - 0.5).abs() < f64::EPSILON);
            } else {
                assert!(value.abs() < f64::EPSILON, "{class} = {value}");
            }
        }
    }

    #[test]
    fn counts_are_conserved() {
        let labels = LabelMap::from_fn(7, 3, |x, y| LandCover::ALL[((x + y * 7) % 9) as usize]).unwrap();
        let histogram = ClassHistogram::from_label_map(&labels);
        let substantive: u64 = LandCover::SUBSTANTIVE.iter().map(|&c| histogram.count(c)).sum();
        assert_eq!(substantive + histogram.count(LandCover::Background), histogram.total());
        assert_eq!(histogram.total(), 21);

        let freq = histogram.frequencies();
        #[allow(clippy::cast_precision_loss)]
        let restored: f64 = freq.iter().map(|(_, f)| f * 21.0).sum::<f64>()
            + histogram.count(LandCover::Background) as f64;
        assert!((restored - 21.0).abs() < 1e-9);
    }

    #[test]
    fn entries_are_fractions() {
        let labels = LabelMap::from_fn(5, 5, |x, _| {
            if x == 0 {
                LandCover::Water
            } else {
                LandCover::Tree
            }
        })
        .unwrap();
        let freq = frequencies(&labels);
        assert!(freq.iter().all(|(_, f)| (0.0..=1.0).contains(&f)));
        assert_eq!(freq.get(LandCover::Water), Some(0.2));
        assert_eq!(freq.get(LandCover::Tree), Some(0.8));
        assert_eq!(freq.get(LandCover::Background), None);
    }

    #[test]
    fn all_background_is_all_zero() {
        let labels = LabelMap::new(3, 3, vec![0; 9]).unwrap();
        assert_eq!(frequencies(&labels), ClassFrequencies([0.0; 8]));
    }

    #[test]
    fn rounding_to_two_places() {
        let freq = ClassFrequencies([0.333_333, 0.125, 0.625, 0.666_7, 0.0, 0.004_9, 0.375, 1.0]);
        let rounded = freq.rounded(2);
        assert_eq!(rounded.0, [0.33, 0.12, 0.62, 0.67, 0.0, 0.0, 0.38, 1.0]);
    }

    #[test]
    fn exact_ties_round_to_even() {
        assert_eq!(round_to(1.031_25, 4), 1.0312);
        assert_eq!(round_to(-0.125, 2), -0.12);
        assert_eq!(round_to(2.5, 0), 2.0);
    }

    #[test]
    fn serializes_as_bare_array() {
        let freq = ClassFrequencies([0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let json = serde_json::to_string(&freq).unwrap();
        assert_eq!(json, "[0.1,0.0,0.0,0.0,0.0,0.0,0.0,0.0]");
    }
}
