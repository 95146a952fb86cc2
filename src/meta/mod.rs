mod client;
mod error;

pub use self::client::MetaClient;
pub use self::error::MetaError;
