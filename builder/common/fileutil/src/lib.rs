mod copy;
mod hardlink;
mod holes;
mod remove;
mod tempdir;

pub use copy::*;
pub use hardlink::*;
pub use holes::*;
pub use remove::*;
pub use tempdir::*;
