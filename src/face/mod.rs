//! Face detection and embedding extraction.
//!
//! Leaf module with no dependencies on the rest of the engine:
//!
//! - `detect`: skin-chroma region detection and multi-face selection
//! - `encode`: fixed-dimension gradient descriptor computation

pub mod detect;
pub mod encode;

pub use detect::{detect_faces, largest_of, FaceRegion, FaceSelection};
pub use encode::{encode_region, ExtractError, FaceEncoder, EMBEDDING_DIM, ENCODER_ID};
