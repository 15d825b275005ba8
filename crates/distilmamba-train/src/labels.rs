//! The six emotion classes of the `dair-ai/emotion` dataset.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const NUM_LABELS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Sadness,
    Joy,
    Love,
    Anger,
    Fear,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; NUM_LABELS] = [
        Emotion::Sadness,
        Emotion::Joy,
        Emotion::Love,
        Emotion::Anger,
        Emotion::Fear,
        Emotion::Surprise,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Sadness => "sadness",
            Emotion::Joy => "joy",
            Emotion::Love => "love",
            Emotion::Anger => "anger",
            Emotion::Fear => "fear",
            Emotion::Surprise => "surprise",
        }
    }

    /// Label names in index order, as stored in run manifests.
    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|e| e.name().to_string()).collect()
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_match_dataset_labels() {
        assert_eq!(Emotion::from_index(0), Some(Emotion::Sadness));
        assert_eq!(Emotion::from_index(5), Some(Emotion::Surprise));
        assert_eq!(Emotion::from_index(6), None);
        for (i, e) in Emotion::ALL.iter().enumerate() {
            assert_eq!(e.index(), i);
        }
    }

    #[test]
    fn display_uses_lowercase_name() {
        assert_eq!(Emotion::Anger.to_string(), "anger");
        assert_eq!(serde_json::to_string(&Emotion::Love).unwrap(), "\"love\"");
    }
}
