pub mod space;
pub mod trial;
pub mod errors;

pub use space::*;
pub use trial::*;
pub use errors::*;
