pub mod candidate;
pub mod detection;
pub mod features;
pub mod fingerprint;
pub mod geometry;

pub use candidate::{MatchCandidate, TextRecognition};
pub use detection::{DetectionMethod, DetectionResult};
pub use features::{Descriptor, DescriptorSet, Keypoint, DESCRIPTOR_BYTES};
pub use fingerprint::{Fingerprint, FingerprintSet, Orientation, Preprocess};
pub use geometry::{Point, Quad};
