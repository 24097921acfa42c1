//! Client library for the Cerebrum bofhd XML-RPC administration service.

pub mod commands;
pub mod connector;
pub mod format;
pub mod session;
pub mod transport;
pub mod types;
pub mod value;
pub mod wash;
pub mod xmlrpc;

pub use commands::{ArgDefault, ArgDescriptor, ArgSpec, CommandDescriptor, CommandTable};
pub use connector::{Connector, ConnectorConfig, DEFAULT_TIMEOUT};
pub use format::{FormatSuggestion, NOT_SET};
pub use session::{Bofh, CLIENT_ID};
pub use transport::{Endpoint, HttpsTransport, Transport, MAX_RESPONSE_BYTES};
pub use types::*;
pub use value::Value;
pub use wash::{escape, wash};
