//! Viralize Project Model
//!
//! Defines the data contracts for one reel session:
//! - **Media:** The uploaded source video and the output resolution presets
//! - **Composition:** User-editable pan/zoom, caption, and identity fields
//! - **Geometry:** Cover-fit placement, pan/zoom mapping, and header metrics
//! - **Preferences:** Locally persisted profile and template presets
//! - **Headline:** Prompt and response contract for caption suggestions
//!
//! Geometry is expressed against a 720 px reference width and scaled to the
//! target canvas, so the same composition renders identically at any size.

pub mod composition;
pub mod geometry;
pub mod headline;
pub mod media;
pub mod preferences;

pub use composition::*;
pub use geometry::*;
pub use headline::*;
pub use media::*;
pub use preferences::*;
