pub mod matcher;
pub mod orb;

pub use matcher::{compare_images, match_descriptors, DescriptorMatch, FeatureMatchResult, GOOD_MATCH_DISTANCE};
pub use orb::{detect_and_describe, OrbParams};
