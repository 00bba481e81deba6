//! Environment name generation.

use uuid::Uuid;

use crate::error::NameError;

pub trait NameGenerator: Send + Sync {
    /// A new name, unique with high probability.
    ///
    /// # Errors
    ///
    /// Returns an error if the generator cannot produce a name.
    fn generate(&self) -> Result<String, NameError>;
}

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "billowing", "bitter", "bold", "brave", "brisk", "calm",
    "crimson", "dawn", "delicate", "divine", "dry", "empty", "falling", "fragrant", "frosty",
    "gentle", "green", "hidden", "holy", "icy", "late", "lingering", "little", "lively", "long",
    "misty", "morning", "muddy", "nameless", "noisy", "old", "patient", "polished", "proud",
    "purple", "quiet", "restless", "rough", "shy", "silent", "small", "snowy", "solitary",
    "sparkling", "spring", "steady", "still", "summer", "twilight", "wandering", "weathered",
    "white", "wild", "winter", "wispy", "withered", "young",
];

const NOUNS: &[&str] = &[
    "bird", "breeze", "brook", "bush", "butterfly", "cherry", "cloud", "darkness", "dew",
    "dream", "dust", "field", "fire", "firefly", "flower", "fog", "forest", "frog", "frost",
    "glade", "glitter", "grass", "haze", "hill", "lake", "leaf", "meadow", "moon", "morning",
    "mountain", "night", "paper", "pine", "pond", "rain", "resonance", "river", "sea", "shadow",
    "shape", "silence", "sky", "smoke", "snow", "snowflake", "sound", "star", "sun", "sunset",
    "surf", "thunder", "tree", "violet", "voice", "water", "waterfall", "wave", "wildflower",
    "wind", "wood",
];

/// Generates `adjective-noun-xxxx` names, with randomness drawn from v4 UUIDs.
#[derive(Debug, Clone)]
pub struct WordNameGenerator {
    adjectives: Vec<String>,
    nouns: Vec<String>,
}

impl Default for WordNameGenerator {
    fn default() -> Self {
        Self::with_words(ADJECTIVES.iter().copied(), NOUNS.iter().copied())
    }
}

impl WordNameGenerator {
    #[must_use]
    pub fn with_words<'a>(
        adjectives: impl IntoIterator<Item = &'a str>,
        nouns: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            adjectives: adjectives.into_iter().map(str::to_string).collect(),
            nouns: nouns.into_iter().map(str::to_string).collect(),
        }
    }
}

impl NameGenerator for WordNameGenerator {
    fn generate(&self) -> Result<String, NameError> {
        if self.adjectives.is_empty() || self.nouns.is_empty() {
            return Err(NameError::Empty);
        }
        let bits = Uuid::new_v4().as_u128();
        #[allow(clippy::cast_possible_truncation)]
        let (a, n, suffix) = (
            (bits % self.adjectives.len() as u128) as usize,
            ((bits >> 32) % self.nouns.len() as u128) as usize,
            (bits >> 64) as u16,
        );
        Ok(format!("{}-{}-{suffix:04x}", self.adjectives[a], self.nouns[n]))
    }
}
