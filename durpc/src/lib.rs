pub use durpc_client::*;
pub use durpc_protocol::*;
pub use durpc_server::*;
