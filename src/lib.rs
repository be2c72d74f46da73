//! peerline — one side of a symmetric request/reply-plus-notification
//! protocol carried as newline-delimited JSON over a duplex byte stream
//! (a local socket, a pipe, a child process's stdio).
//!
//! Each peer may issue **commands** (each expecting exactly one `return`
//! or `error` reply), send fire-and-forget **notifications**, and must
//! answer the peer's commands and notifications through registered
//! handlers. At most one command is in flight per direction at any time,
//! and inbound messages are processed strictly in arrival order — the
//! protocol forbids pipelining by construction.
//!
//! Wire format: UTF-8 text, one JSON object per line, `\n`-terminated.
//! Exactly one top-level key selects the kind:
//!
//! ```text
//! {"command": "<name>", "data": <any>}       // data omitted if absent
//! {"notification": "<name>", "data": <any>}  // data omitted if absent
//! {"return": <any-or-null>}                  // always present
//! {"error": <any-or-null>}                   // always present
//! ```
//!
//! # Example
//!
//! ```no_run
//! use peerline::{Endpoint, HandlerRegistry, StreamTransport, Wire};
//! use serde_json::Value;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = HandlerRegistry::new()
//!     .command("ping", |wire: &mut Wire<'_>, _data, responder| {
//!         responder.reply(wire, Value::Null)?;
//!         Ok(())
//!     })
//!     .notification("peer-status", |_wire: &mut Wire<'_>, data| {
//!         println!("peer status: {data:?}");
//!         Ok(())
//!     });
//!
//! let mut endpoint = Endpoint::new(registry);
//! endpoint.on_error(|fault| eprintln!("connection fault: {fault}"));
//! endpoint.on_close(|| eprintln!("connection closed"));
//!
//! let stream = tokio::net::UnixStream::connect("/run/app.sock").await?;
//! let (read, write) = stream.into_split();
//! endpoint.bind(StreamTransport::new(read, write));
//! endpoint.run().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod transport;

pub use codec::Envelope;
pub use endpoint::{Endpoint, EndpointState, ErrorCallback, Responder, ReturnCallback, Wire};
pub use error::{DecodeError, Fault, HandlerError, ProtocolViolation, SendError};
pub use registry::{CommandHandler, HandlerRegistry, NotificationHandler};
pub use transport::{MockHandle, MockTransport, StreamTransport, Transport, TransportError};
