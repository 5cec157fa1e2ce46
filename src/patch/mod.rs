// Patch application and cancellation
pub mod apply;
pub mod cancel;
pub mod relocate;
pub mod safety;

pub use apply::apply_patches;
pub use cancel::unapply_patches;
