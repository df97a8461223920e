pub mod error;
pub mod requests;
pub mod traits;
pub mod types;

#[cfg(feature = "memory")]
pub mod memory;

pub use error::*;
pub use requests::*;
pub use traits::*;
pub use types::*;
