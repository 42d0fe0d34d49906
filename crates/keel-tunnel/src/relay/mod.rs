//! Traffic relays carried over an established tunnel's local port

mod request;
mod stream;

pub use request::{invoke_path, invoke_url, invoke_url_at, RequestRelay, DEFAULT_API_VERSION};
pub use stream::{ws_url, ws_url_at, ControlKind, Frame, StreamConnection, StreamEnd, StreamRelay};
