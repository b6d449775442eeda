//! Window interactor: bridges viewport display surfaces to a remote renderer.
//!
//! A [`Page`] owns one transport and the surfaces registered on it. Each
//! viewport gets an [`Interactor`] that relays commands, actions and input to
//! the renderer and pulls fresh frames and state back into its surface.

pub mod interactor;
pub mod overlay;
pub mod page;
pub mod surface;

pub use interactor::Interactor;
pub use overlay::{CommandSink, LatestState, Overlay, OverlayFactory};
pub use page::Page;
pub use surface::{FileSurface, LoadCallback, MemorySurface, Surface};
