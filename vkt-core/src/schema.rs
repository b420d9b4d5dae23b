//! Coordinate Schema - Closed Vocabularies
//!
//! The four fixed coordinate segments are finite enums. Which Domains a
//! Category admits, and which Attributes a Domain admits, are static tables
//! below; there is no runtime dictionary to drift out of sync.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            /// Exact, case-sensitive match against the variant name.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $(stringify!($variant) => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn parse_ignore_case(s: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.as_str().eq_ignore_ascii_case(s))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary! {
    /// Top-level asset family.
    Category { Music, Video, Image, Text, Voice }
}

vocabulary! {
    /// Production domain within a category.
    Domain {
        Vocal, Instrument, Mix, Master, Lyric,
        Edit, Footage, Animation, Effects,
        Illustration, Photo, Design,
        Script, Copy,
        Narration, Dialogue,
    }
}

vocabulary! {
    /// The property of the asset being addressed.
    Attribute {
        Pitch, Tempo, Timbre, Harmony, Arrangement,
        Balance, Dynamics, Spatial, Loudness,
        Meter, Rhyme, Theme,
        ColorGrade, Cut, Transition, Pacing, Resolution, Framing,
        Motion, Style, Compositing,
        Palette, Composition, Exposure, Layout, Typography,
        Structure, Tone,
    }
}

vocabulary! {
    /// Lifecycle state. Variants are declared in progression order.
    State { Draft, Validated, Published, Archived }
}

impl Category {
    pub fn domains(self) -> &'static [Domain] {
        use Domain::*;
        match self {
            Category::Music => &[Vocal, Instrument, Mix, Master, Lyric],
            Category::Video => &[Edit, Footage, Animation, Effects],
            Category::Image => &[Illustration, Photo, Design],
            Category::Text => &[Script, Lyric, Copy],
            Category::Voice => &[Vocal, Narration, Dialogue],
        }
    }

    pub fn allows(self, domain: Domain) -> bool {
        self.domains().contains(&domain)
    }
}

impl Domain {
    pub fn attributes(self) -> &'static [Attribute] {
        use Attribute::*;
        match self {
            Domain::Vocal => &[Pitch, Tempo, Timbre, Harmony],
            Domain::Instrument => &[Pitch, Tempo, Timbre, Arrangement],
            Domain::Mix => &[Balance, Dynamics, Spatial],
            Domain::Master => &[Loudness, Dynamics],
            Domain::Lyric => &[Meter, Rhyme, Theme],
            Domain::Edit => &[ColorGrade, Cut, Transition, Pacing],
            Domain::Footage => &[Resolution, ColorGrade, Framing],
            Domain::Animation => &[Motion, Style, Pacing],
            Domain::Effects => &[Motion, Compositing],
            Domain::Illustration => &[Style, Palette, Composition],
            Domain::Photo => &[Composition, Palette, Resolution, Exposure],
            Domain::Design => &[Palette, Layout, Typography],
            Domain::Script => &[Structure, Tone, Pacing],
            Domain::Copy => &[Tone, Structure],
            Domain::Narration => &[Tone, Pacing, Timbre],
            Domain::Dialogue => &[Tone, Timbre, Pacing],
        }
    }

    pub fn allows(self, attribute: Attribute) -> bool {
        self.attributes().contains(&attribute)
    }
}

impl State {
    /// The state a record must have passed through before this one.
    /// `None` for entry states, which may be created directly.
    pub fn required_predecessor(self) -> Option<State> {
        match self {
            State::Draft | State::Validated => None,
            State::Published => Some(State::Validated),
            State::Archived => Some(State::Published),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == State::Archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_sensitive() {
        assert_eq!(Category::parse("Music"), Some(Category::Music));
        assert_eq!(Category::parse("music"), None);
        assert_eq!(Category::parse_ignore_case("mUsIc"), Some(Category::Music));
    }

    #[test]
    fn test_every_category_has_domains_with_attributes() {
        for category in Category::ALL {
            assert!(!category.domains().is_empty());
            for domain in category.domains() {
                assert!(!domain.attributes().is_empty(), "{domain} has no attributes");
            }
        }
    }

    #[test]
    fn test_compatibility_tables() {
        assert!(Category::Music.allows(Domain::Vocal));
        assert!(!Category::Image.allows(Domain::Vocal));
        assert!(Domain::Edit.allows(Attribute::ColorGrade));
        assert!(!Domain::Vocal.allows(Attribute::ColorGrade));
    }

    #[test]
    fn test_state_progression() {
        assert_eq!(State::Draft.required_predecessor(), None);
        assert_eq!(State::Validated.required_predecessor(), None);
        assert_eq!(State::Published.required_predecessor(), Some(State::Validated));
        assert_eq!(State::Archived.required_predecessor(), Some(State::Published));
        assert!(State::Archived.is_terminal());
        assert!(State::Draft < State::Archived);
    }
}
