mod intercept;
mod message_stream;
pub mod protocol;
pub(crate) mod rows;
mod session;
mod session_state;
pub mod sql;
mod upstream;

pub use self::intercept::{CaptureLimits, Intercept, PendingQuery};
pub use self::message_stream::MessageStream;
pub use self::session::{run_session, SessionContext};
pub use self::session_state::SessionState;
pub use self::upstream::{BoxedStream, Stream, TcpUpstreamConnector, UpstreamConnector};
