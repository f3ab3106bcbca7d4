//! Identifier types shared across the export layers
//!
//! The host library and the destination database use independent integer
//! id spaces. Each gets its own newtype so a source id can never be passed
//! where a destination id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Track identifier in the host library
    TrackId
);

id_type!(
    /// Crate identifier in the host library
    CrateId
);

id_type!(
    /// Track identifier in the destination database
    DestTrackId
);

id_type!(
    /// Crate identifier in the destination database
    DestCrateId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_integers() {
        let yaml = serde_yaml::to_string(&vec![TrackId(3), TrackId(7)]).unwrap();
        let back: Vec<TrackId> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, vec![TrackId(3), TrackId(7)]);
        assert!(!yaml.contains("TrackId"));
    }

    #[test]
    fn test_display_is_the_raw_number() {
        assert_eq!(DestCrateId(42).to_string(), "42");
    }
}
