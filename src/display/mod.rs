pub mod display;
pub mod snapshot;

pub use display::Sdl2Display;
pub use snapshot::{save_snapshot, SnapshotError};
