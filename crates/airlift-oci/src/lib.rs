//! Airlift OCI - image staging between the sealed bundle and the cluster registry
//!
//! The pull side resolves mixed image sources (remote registries, tarballs,
//! the local daemon) into an on-disk OCI layout with a shared layer cache;
//! the push side replays that layout into the cluster registry. See `pull`
//! for the two-phase pipeline and its fallback behavior.

pub mod cache;
pub mod daemon;
pub mod error;
pub mod layout;
pub mod pull;
pub mod push;
pub mod reference;
pub mod tarball;

pub use cache::LayerCache;
pub use error::{OciError, Result};
pub use layout::{LayoutIndex, OciLayout};
pub use pull::{pull, PullConfig, PulledImage, DEFAULT_CONCURRENCY};
pub use push::{push, PushConfig, PushedImage};
pub use reference::ImageRef;
