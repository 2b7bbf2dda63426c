pub mod batch;
pub mod error;
pub mod rate_limit;
pub mod router;
pub mod server;

pub use batch::*;
pub use error::*;
pub use rate_limit::*;
pub use router::*;
pub use server::*;
