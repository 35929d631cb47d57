//! Media Capture capability
//!
//! Local capture devices and display capture, seen from the call layer:
//! - Track handles with shared enabled/live state
//! - Streams grouping the tracks of one acquisition
//! - The `MediaCapture` seam platform backends implement

mod capture;
mod track;

pub use capture::{MediaCapture, MediaConstraints, MediaError};
pub use track::{MediaStream, MediaTrack, StreamId, TrackId, TrackKind, TrackSource};
