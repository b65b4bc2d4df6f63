pub mod channel;
pub mod descriptor;
pub mod types;

mod error;
pub use descriptor::{ConnectionDescriptor, Network, ReattachProviders, registry_key};
pub use error::{BoxError, Error, Result};
