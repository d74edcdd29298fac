//! The fixed land-cover class registry.
//!
//! Nine classes: one `Background` sentinel (id 0) plus eight substantive
//! classes. The set is closed; adding a class means editing this enum and
//! retraining the network, so it is modeled as an enum rather than a
//! runtime table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Total number of classes, background included.
pub const NUM_CLASSES: usize = 9;

/// Number of substantive (non-background) classes.
pub const NUM_SUBSTANTIVE: usize = NUM_CLASSES - 1;

/// A land-cover class.
///
/// The discriminant is the class id the segmentation network uses for
/// its output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LandCover {
    /// Sentinel for unlabeled pixels. Excluded from area fractions.
    Background = 0,
    Bareland = 1,
    Rangeland = 2,
    DevelopedSpace = 3,
    Road = 4,
    Tree = 5,
    Water = 6,
    AgricultureLand = 7,
    Building = 8,
}

impl LandCover {
    /// Every class, in ascending id order.
    pub const ALL: [Self; NUM_CLASSES] = [
        Self::Background,
        Self::Bareland,
        Self::Rangeland,
        Self::DevelopedSpace,
        Self::Road,
        Self::Tree,
        Self::Water,
        Self::AgricultureLand,
        Self::Building,
    ];

    /// The substantive classes, in ascending id order. This is the order
    /// of entries in a [`ClassFrequencies`](crate::ClassFrequencies)
    /// vector.
    pub const SUBSTANTIVE: [Self; NUM_SUBSTANTIVE] = [
        Self::Bareland,
        Self::Rangeland,
        Self::DevelopedSpace,
        Self::Road,
        Self::Tree,
        Self::Water,
        Self::AgricultureLand,
        Self::Building,
    ];

    /// Look up a class by id.
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Background),
            1 => Some(Self::Bareland),
            2 => Some(Self::Rangeland),
            3 => Some(Self::DevelopedSpace),
            4 => Some(Self::Road),
            5 => Some(Self::Tree),
            6 => Some(Self::Water),
            7 => Some(Self::AgricultureLand),
            8 => Some(Self::Building),
            _ => None,
        }
    }

    /// The class id (network channel index).
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Channel index into a probability field.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Display name, as used by the trained network's label table.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Bareland => "Bareland",
            Self::Rangeland => "Rangeland",
            Self::DevelopedSpace => "Developed Space",
            Self::Road => "Road",
            Self::Tree => "Tree",
            Self::Water => "Water",
            Self::AgricultureLand => "Agriculture land",
            Self::Building => "Building",
        }
    }

    /// Color used when rendering a label map.
    #[must_use]
    pub const fn color(self) -> [u8; 3] {
        match self {
            Self::Background => [0, 0, 0],
            Self::Bareland => [255, 0, 0],
            Self::Rangeland => [255, 255, 0],
            Self::DevelopedSpace => [192, 192, 192],
            Self::Road => [255, 255, 255],
            Self::Tree => [0, 255, 0],
            Self::Water => [0, 0, 255],
            Self::AgricultureLand => [128, 0, 128],
            Self::Building => [255, 165, 0],
        }
    }

    /// Whether this is the background sentinel.
    #[must_use]
    pub const fn is_background(self) -> bool {
        matches!(self, Self::Background)
    }
}

impl fmt::Display for LandCover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_match_positions() {
        for (i, class) in LandCover::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
            assert_eq!(LandCover::from_id(class.id()), Some(*class));
        }
    }

    #[test]
    fn exactly_one_background() {
        let count = LandCover::ALL.iter().filter(|c| c.is_background()).count();
        assert_eq!(count, 1);
        assert_eq!(LandCover::Background.id(), 0);
    }

    #[test]
    fn substantive_is_all_without_background() {
        assert_eq!(&LandCover::ALL[1..], &LandCover::SUBSTANTIVE[..]);
    }

    #[test]
    fn unknown_id_is_none() {
        assert_eq!(LandCover::from_id(9), None);
        assert_eq!(LandCover::from_id(255), None);
    }

    #[test]
    fn road_is_white() {
        assert_eq!(LandCover::Road.id(), 4);
        assert_eq!(LandCover::Road.name(), "Road");
        assert_eq!(LandCover::Road.color(), [255, 255, 255]);
    }

    #[test]
    fn colors_are_distinct() {
        for a in LandCover::ALL {
            for b in LandCover::ALL {
                if a != b {
                    assert_ne!(a.color(), b.color(), "{a} and {b} share a color");
                }
            }
        }
    }
}
