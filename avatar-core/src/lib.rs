pub mod compute;
pub mod model;
pub mod rig;
pub mod secondary;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
