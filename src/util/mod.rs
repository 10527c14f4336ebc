mod bits;
pub use bits::*;

mod bench;
pub use bench::*;
