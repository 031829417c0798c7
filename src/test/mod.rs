
pub use builder::{pattern, PeBuilder};
