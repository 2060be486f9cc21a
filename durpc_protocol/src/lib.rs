pub mod codec;
pub mod error;
pub mod message;
pub mod session;
pub mod tls;

pub use codec::*;
pub use error::*;
pub use message::*;
pub use session::*;
pub use tls::*;
