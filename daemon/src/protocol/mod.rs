pub mod connection;
pub mod engine;
pub mod events;
pub mod session;

pub use connection::Connection;
pub use events::ProtocolEvent;
pub use session::{RunStage, Session, SessionState};
