//! Endpoint core state machine and lifecycle controller.
//!
//! An [`Endpoint`] is one side of a duplex line-delimited JSON protocol
//! connection. It owns the read loop, enforces the
//! single-outstanding-command invariant in each direction, routes decoded
//! messages to registered handlers, and drives teardown.
//!
//! Invariants maintained here:
//!
//! - At most one inbound and at most one outbound command is pending at
//!   any time (independently per direction — one of each may coexist).
//! - Messages are processed strictly in arrival order; a line is fully
//!   handled before the next read is armed.
//! - Once teardown begins, no further bytes are written to the transport.
//! - The transport and its cancellation token are released exactly once,
//!   and the `on_close` hook fires exactly once, however closure was
//!   triggered.
//!
//! The endpoint is deliberately not safe for concurrent external calls:
//! all interaction happens from the task driving [`Endpoint::run`],
//! either through `&mut` methods or through the [`Wire`] passed to
//! handlers and reply callbacks.

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::codec::{self, Envelope};
use crate::error::{Fault, HandlerError, ProtocolViolation, SendError};
use crate::registry::HandlerRegistry;
use crate::transport::Transport;

/// Lifecycle of an endpoint. `Closed` is terminal; the endpoint is not
/// reused afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unbound,
    Active,
    Closing,
    Closed,
}

/// Callback invoked with the peer's `return` payload for a locally
/// issued command.
pub type ReturnCallback =
    Box<dyn FnOnce(&mut Wire<'_>, Value) -> Result<(), HandlerError> + Send>;

/// Callback invoked with the peer's `error` payload for a locally issued
/// command. Receiving an `error` envelope is a business outcome, not a
/// connection fault; the endpoint stays open.
pub type ErrorCallback =
    Box<dyn FnOnce(&mut Wire<'_>, Value) -> Result<(), HandlerError> + Send>;

type ErrorHook = Box<dyn FnOnce(Fault) + Send>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// The locally issued command awaiting its reply.
struct PendingOutbound {
    name: String,
    on_return: Option<ReturnCallback>,
    on_error: Option<ErrorCallback>,
}

/// The peer's command awaiting our reply.
struct PendingInbound {
    name: String,
    seq: u64,
}

/// Shared internals behind both [`Endpoint`] and [`Wire`].
struct Core {
    state: EndpointState,
    transport: Option<Box<dyn Transport>>,
    cancel: Option<CancellationToken>,
    pending_inbound: Option<PendingInbound>,
    pending_outbound: Option<PendingOutbound>,
    inbound_seq: u64,
    on_error: Option<ErrorHook>,
    on_close: Option<CloseHook>,
}

impl Core {
    fn send_command(
        &mut self,
        name: &str,
        data: Option<Value>,
        on_return: Option<ReturnCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Result<(), SendError> {
        if self.state != EndpointState::Active {
            return Err(SendError::NotActive);
        }
        if self.pending_outbound.is_some() {
            return Err(SendError::CommandInFlight);
        }

        self.write(&Envelope::Command {
            name: name.to_string(),
            data,
        })?;
        self.pending_outbound = Some(PendingOutbound {
            name: name.to_string(),
            on_return,
            on_error,
        });
        debug!(command = name, "command sent, outbound slot occupied");
        Ok(())
    }

    fn send_notification(&mut self, name: &str, data: Option<Value>) -> Result<(), SendError> {
        match self.state {
            EndpointState::Unbound => Err(SendError::NotActive),
            EndpointState::Active => self.write(&Envelope::Notification {
                name: name.to_string(),
                data,
            }),
            // safe to call opportunistically during shutdown
            EndpointState::Closing | EndpointState::Closed => Ok(()),
        }
    }

    /// Consume the reply capsule identified by `seq`: write the envelope
    /// and free the inbound slot. The slot is freed even when the write
    /// is suppressed by a close in progress.
    fn send_reply(&mut self, seq: u64, envelope: Envelope) -> Result<(), SendError> {
        assert!(
            self.pending_inbound.as_ref().is_some_and(|p| p.seq == seq),
            "responder does not belong to the pending inbound command"
        );

        self.write(&envelope)?;
        if let Some(pending) = self.pending_inbound.take() {
            debug!(command = %pending.name, "reply sent, inbound slot freed");
        }
        Ok(())
    }

    /// Encode and write one envelope. Suppressed (dropped, not an error)
    /// once teardown has begun.
    fn write(&mut self, envelope: &Envelope) -> Result<(), SendError> {
        if self.state != EndpointState::Active {
            return Ok(());
        }
        let line = codec::encode(envelope)?;
        if let Some(transport) = self.transport.as_mut() {
            trace!(line = line.trim_end(), "line sent");
            transport.write_line(&line)?;
        }
        Ok(())
    }

    fn close(&mut self, immediate: bool) {
        match self.state {
            EndpointState::Unbound => panic!("close() on an unbound endpoint"),
            EndpointState::Active => {
                self.release();
                self.state = EndpointState::Closing;
                debug!(immediate, "endpoint closing");
                if immediate {
                    self.finish_close();
                }
            }
            // resources are released exactly once and the close hook is
            // not re-run
            EndpointState::Closing | EndpointState::Closed => {}
        }
    }

    /// Cancel the pending read and release the transport. Runs at most
    /// once per endpoint lifetime.
    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    /// Teardown completion: mark Closed, drop pending state, fire the
    /// close hook.
    fn finish_close(&mut self) {
        self.state = EndpointState::Closed;
        self.pending_inbound = None;
        self.pending_outbound = None;
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        debug!("endpoint closed");
    }

    /// The single catch point for faults: report once, then tear down
    /// unconditionally.
    ///
    /// A fault surfacing while a close is already in progress means
    /// application code kept going after scheduling teardown; that is a
    /// programming defect and fails fast.
    fn fault(&mut self, fault: Fault) {
        assert!(
            self.state == EndpointState::Active,
            "fault raised while endpoint is {:?}: {fault}",
            self.state
        );
        error!(%fault, "endpoint fault, tearing down");

        if let Some(on_error) = self.on_error.take() {
            on_error(fault);
        }
        self.release();
        self.state = EndpointState::Closing;
        self.finish_close();
    }
}

/// Send/close surface handed to handlers and reply callbacks.
///
/// A `Wire` borrows the endpoint for the duration of one handler
/// invocation, so everything a handler does happens on the endpoint's
/// own task — there is no cross-task sharing and no locking.
pub struct Wire<'a> {
    core: &'a mut Core,
}

impl Wire<'_> {
    /// Issue a command to the peer. See [`Endpoint::send_command`].
    pub fn send_command<P: Serialize>(
        &mut self,
        name: &str,
        data: Option<P>,
        on_return: Option<ReturnCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Result<(), SendError> {
        self.core
            .send_command(name, to_value_opt(data)?, on_return, on_error)
    }

    /// Send a fire-and-forget notification. See
    /// [`Endpoint::send_notification`].
    pub fn send_notification<P: Serialize>(
        &mut self,
        name: &str,
        data: Option<P>,
    ) -> Result<(), SendError> {
        self.core.send_notification(name, to_value_opt(data)?)
    }

    /// Close the endpoint. See [`Endpoint::close`].
    pub fn close(&mut self, immediate: bool) {
        self.core.close(immediate);
    }

    pub fn state(&self) -> EndpointState {
        self.core.state
    }
}

/// One-shot reply capsule bound to a single inbound command.
///
/// Consuming it — via [`Responder::reply`] or [`Responder::fail`] —
/// writes the reply envelope and frees the inbound slot. Move semantics
/// make a second reply unrepresentable. Dropping the capsule leaves the
/// command pending, so it may be stashed and consumed from a later
/// handler invocation on the same endpoint.
#[derive(Debug)]
pub struct Responder {
    seq: u64,
}

impl Responder {
    /// Answer the pending command with a `return` envelope. The payload
    /// is always present on the wire; pass `Value::Null` for "none".
    ///
    /// # Panics
    ///
    /// If the capsule no longer matches the pending inbound command
    /// (possible only by mixing capsules across endpoints, or by
    /// replying after the endpoint closed and dropped the slot).
    pub fn reply<P: Serialize>(self, wire: &mut Wire<'_>, data: P) -> Result<(), SendError> {
        let value = serde_json::to_value(data)?;
        wire.core.send_reply(self.seq, Envelope::Return(value))
    }

    /// Answer the pending command with an `error` envelope.
    ///
    /// # Panics
    ///
    /// Same conditions as [`Responder::reply`].
    pub fn fail<P: Serialize>(self, wire: &mut Wire<'_>, data: P) -> Result<(), SendError> {
        let value = serde_json::to_value(data)?;
        wire.core.send_reply(self.seq, Envelope::Error(value))
    }
}

/// One side of a duplex line-delimited JSON protocol connection.
pub struct Endpoint {
    registry: HandlerRegistry,
    core: Core,
}

impl Endpoint {
    /// Create an unbound endpoint with the given dispatch tables.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            core: Core {
                state: EndpointState::Unbound,
                transport: None,
                cancel: None,
                pending_inbound: None,
                pending_outbound: None,
                inbound_seq: 0,
                on_error: None,
                on_close: None,
            },
        }
    }

    /// Install the fault hook, invoked at most once, right before
    /// teardown. The hook receives no [`Wire`], so it cannot call back
    /// into send or close.
    pub fn on_error<F>(&mut self, hook: F)
    where
        F: FnOnce(Fault) + Send + 'static,
    {
        self.core.on_error = Some(Box::new(hook));
    }

    /// Install the close hook, invoked exactly once when teardown
    /// completes, whatever triggered it. Same re-entrancy rule as
    /// [`Endpoint::on_error`].
    pub fn on_close<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.on_close = Some(Box::new(hook));
    }

    /// Bind the endpoint to its transport: `Unbound` → `Active`. Creates
    /// the read-cancellation token.
    ///
    /// # Panics
    ///
    /// If the endpoint is already bound.
    pub fn bind<T>(&mut self, transport: T)
    where
        T: Transport + 'static,
    {
        assert!(
            self.core.state == EndpointState::Unbound,
            "endpoint is already bound"
        );
        self.core.transport = Some(Box::new(transport));
        self.core.cancel = Some(CancellationToken::new());
        self.core.state = EndpointState::Active;
        debug!("endpoint bound, active");
    }

    pub fn state(&self) -> EndpointState {
        self.core.state
    }

    /// Issue a command to the peer.
    ///
    /// Valid only while `Active`; fails with [`SendError::CommandInFlight`]
    /// while a previous command awaits its reply. If neither callback is
    /// supplied, a later non-null `return` from the peer is a protocol
    /// violation — nothing could consume it.
    pub fn send_command<P: Serialize>(
        &mut self,
        name: &str,
        data: Option<P>,
        on_return: Option<ReturnCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Result<(), SendError> {
        self.core
            .send_command(name, to_value_opt(data)?, on_return, on_error)
    }

    /// Send a fire-and-forget notification.
    ///
    /// A silent no-op once closing has begun, so it is safe to call
    /// opportunistically during shutdown.
    pub fn send_notification<P: Serialize>(
        &mut self,
        name: &str,
        data: Option<P>,
    ) -> Result<(), SendError> {
        self.core.send_notification(name, to_value_opt(data)?)
    }

    /// Begin teardown: cancel the pending read, release the transport,
    /// and stop all writes, synchronously.
    ///
    /// With `immediate` the close hook runs within this call; otherwise
    /// it is deferred to the next turn of the driving [`Endpoint::run`]
    /// loop, after the call stack that triggered the close has unwound.
    /// Further calls are no-ops: resources are released exactly once and
    /// the hook never re-fires.
    ///
    /// # Panics
    ///
    /// If the endpoint was never bound.
    pub fn close(&mut self, immediate: bool) {
        self.core.close(immediate);
    }

    /// Drive the endpoint until it reaches `Closed`.
    ///
    /// Arms one line read at a time and fully processes each message
    /// before the next read; the read is raced against the cancellation
    /// token so a close interrupts it. Faults are reported through the
    /// `on_error` hook and end the loop after teardown.
    ///
    /// # Panics
    ///
    /// If the endpoint was never bound.
    pub async fn run(&mut self) {
        assert!(
            self.core.state != EndpointState::Unbound,
            "run() on an unbound endpoint"
        );

        loop {
            match self.core.state {
                EndpointState::Unbound => unreachable!(),
                EndpointState::Active => {}
                // deferred close completion: the triggering call stack
                // has unwound by the time control returns here
                EndpointState::Closing => {
                    self.core.finish_close();
                    return;
                }
                EndpointState::Closed => return,
            }

            let Some(cancel) = self.core.cancel.clone() else {
                return;
            };
            let read = {
                let Some(transport) = self.core.transport.as_mut() else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => continue,
                    read = transport.read_line() => read,
                }
            };

            let line = match read {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.core.fault(Fault::PeerClosed);
                    return;
                }
                Err(e) => {
                    self.core.fault(Fault::Transport(e));
                    return;
                }
            };

            trace!(line = line.trim_end(), "line received");
            if let Err(fault) = Self::dispatch(&mut self.registry, &mut self.core, &line) {
                self.core.fault(fault);
                return;
            }
        }
    }

    /// Route one decoded envelope. Any `Err` is a fault for the caller
    /// to raise.
    fn dispatch(registry: &mut HandlerRegistry, core: &mut Core, line: &str) -> Result<(), Fault> {
        match codec::decode(line)? {
            Envelope::Command { name, data } => {
                if core.pending_inbound.is_some() {
                    return Err(ProtocolViolation::CommandAlreadyPending.into());
                }
                let Some(handler) = registry.command_mut(&name) else {
                    return Err(ProtocolViolation::UnknownCommand(name).into());
                };

                core.inbound_seq += 1;
                let seq = core.inbound_seq;
                core.pending_inbound = Some(PendingInbound {
                    name: name.clone(),
                    seq,
                });
                debug!(command = %name, "dispatching command");
                handler(&mut Wire { core }, data, Responder { seq }).map_err(Fault::Handler)
            }
            Envelope::Notification { name, data } => {
                let Some(handler) = registry.notification_mut(&name) else {
                    return Err(ProtocolViolation::UnknownNotification(name).into());
                };
                debug!(notification = %name, "dispatching notification");
                handler(&mut Wire { core }, data).map_err(Fault::Handler)
            }
            Envelope::Return(value) => {
                let Some(pending) = core.pending_outbound.take() else {
                    return Err(ProtocolViolation::UnmatchedReturn.into());
                };
                debug!(command = %pending.name, "return received, outbound slot freed");
                match pending.on_return {
                    Some(callback) => callback(&mut Wire { core }, value).map_err(Fault::Handler),
                    None if value.is_null() => Ok(()),
                    None => Err(ProtocolViolation::MissingReturnCallback(pending.name).into()),
                }
            }
            Envelope::Error(value) => {
                let Some(pending) = core.pending_outbound.take() else {
                    return Err(ProtocolViolation::UnmatchedError.into());
                };
                let Some(callback) = pending.on_error else {
                    return Err(ProtocolViolation::MissingErrorCallback(pending.name).into());
                };
                debug!(command = %pending.name, "error received, outbound slot freed");
                callback(&mut Wire { core }, value).map_err(Fault::Handler)
            }
        }
    }
}

fn to_value_opt<P: Serialize>(data: Option<P>) -> Result<Option<Value>, SendError> {
    data.map(serde_json::to_value)
        .transpose()
        .map_err(SendError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Endpoint whose `on_close` increments `closes` and whose `on_error`
    /// stashes the fault.
    fn observed_endpoint(
        registry: HandlerRegistry,
    ) -> (Endpoint, Arc<AtomicUsize>, Arc<Mutex<Option<Fault>>>) {
        let mut endpoint = Endpoint::new(registry);
        let closes = Arc::new(AtomicUsize::new(0));
        let fault = Arc::new(Mutex::new(None));
        {
            let closes = Arc::clone(&closes);
            endpoint.on_close(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let fault = Arc::clone(&fault);
            endpoint.on_error(move |f| {
                *fault.lock().unwrap() = Some(f);
            });
        }
        (endpoint, closes, fault)
    }

    #[tokio::test]
    async fn command_reply_emits_return_envelope() {
        let registry =
            HandlerRegistry::new().command("ping", |wire: &mut Wire<'_>, data, responder| {
                assert!(data.is_none());
                responder.reply(wire, Value::Null)?;
                Ok(())
            });
        let (mut endpoint, closes, fault) = observed_endpoint(registry);

        let transport = MockTransport::with_lines(["{\"command\":\"ping\"}\n"]);
        let handle = transport.handle();
        endpoint.bind(transport);
        endpoint.run().await;

        assert_eq!(handle.sent_lines(), vec!["{\"return\":null}\n"]);
        // script exhausted afterwards: the peer-closed fault ends the run
        assert!(matches!(*fault.lock().unwrap(), Some(Fault::PeerClosed)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.close_count(), 1);
        assert_eq!(endpoint.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn return_invokes_callback_and_frees_outbound_slot() {
        let (mut endpoint, _closes, _fault) = observed_endpoint(HandlerRegistry::new());
        let received = Arc::new(Mutex::new(None));

        let transport = MockTransport::with_lines(["{\"return\":3}\n"]);
        let handle = transport.handle();
        endpoint.bind(transport);

        let on_return = {
            let received = Arc::clone(&received);
            Box::new(move |wire: &mut Wire<'_>, value: Value| {
                *received.lock().unwrap() = Some(value);
                // the slot is free again: the next command goes through
                wire.send_command::<Value>("noop", None, None, None)?;
                Ok(())
            })
        };
        endpoint
            .send_command("add", Some(json!({"a": 1, "b": 2})), Some(on_return), None)
            .unwrap();
        endpoint.run().await;

        assert_eq!(*received.lock().unwrap(), Some(json!(3)));
        assert_eq!(
            handle.sent_lines(),
            vec![
                "{\"command\":\"add\",\"data\":{\"a\":1,\"b\":2}}\n",
                "{\"command\":\"noop\"}\n",
            ]
        );
    }

    #[test]
    fn second_command_while_in_flight_is_rejected() {
        let (mut endpoint, _closes, _fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::new());

        endpoint
            .send_command::<Value>("first", None, None, None)
            .unwrap();
        assert!(matches!(
            endpoint.send_command::<Value>("second", None, None, None),
            Err(SendError::CommandInFlight)
        ));
    }

    #[tokio::test]
    async fn one_pending_command_per_direction_may_coexist() {
        let registry =
            HandlerRegistry::new().command("work", |wire: &mut Wire<'_>, _data, responder| {
                // inbound pending; issuing our own command occupies the
                // independent outbound slot
                wire.send_command::<Value>("progress", None, None, None)?;
                responder.reply(wire, json!("done"))?;
                Ok(())
            });
        let (mut endpoint, _closes, fault) = observed_endpoint(registry);

        let transport = MockTransport::with_lines(["{\"command\":\"work\"}\n"]);
        let handle = transport.handle();
        endpoint.bind(transport);
        endpoint.run().await;

        assert_eq!(
            handle.sent_lines(),
            vec!["{\"command\":\"progress\"}\n", "{\"return\":\"done\"}\n"]
        );
        assert!(matches!(*fault.lock().unwrap(), Some(Fault::PeerClosed)));
    }

    #[tokio::test]
    async fn non_null_return_with_no_callback_is_a_violation() {
        let (mut endpoint, closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{\"return\":3}\n"]));
        endpoint
            .send_command::<Value>("fire", None, None, None)
            .unwrap();
        endpoint.run().await;

        match fault.lock().unwrap().take() {
            Some(Fault::Protocol(ProtocolViolation::MissingReturnCallback(name))) => {
                assert_eq!(name, "fire");
            }
            other => panic!("expected missing-return-callback violation, got {other:?}"),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_return_with_no_callback_is_fine() {
        let (mut endpoint, _closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{\"return\":null}\n"]));
        endpoint
            .send_command::<Value>("fire", None, None, None)
            .unwrap();
        endpoint.run().await;

        // the null return was consumed silently; only the end of the
        // script faulted the endpoint
        assert!(matches!(*fault.lock().unwrap(), Some(Fault::PeerClosed)));
    }

    #[tokio::test]
    async fn unmatched_return_is_a_violation() {
        let (mut endpoint, _closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{\"return\":1}\n"]));
        endpoint.run().await;

        assert!(matches!(
            *fault.lock().unwrap(),
            Some(Fault::Protocol(ProtocolViolation::UnmatchedReturn))
        ));
    }

    #[tokio::test]
    async fn peer_error_is_a_business_outcome_not_a_fault() {
        let (mut endpoint, closes, fault) = observed_endpoint(HandlerRegistry::new());
        let received = Arc::new(Mutex::new(None));

        let transport = MockTransport::with_lines(["{\"error\":\"denied\"}\n"]);
        let handle = transport.handle();
        endpoint.bind(transport);

        let on_error = {
            let received = Arc::clone(&received);
            Box::new(move |wire: &mut Wire<'_>, value: Value| {
                *received.lock().unwrap() = Some(value);
                // the connection is still open
                wire.send_notification("giving-up", Some(json!(1)))?;
                Ok(())
            })
        };
        endpoint
            .send_command::<Value>("restricted", None, None, Some(on_error))
            .unwrap();
        endpoint.run().await;

        assert_eq!(*received.lock().unwrap(), Some(json!("denied")));
        assert_eq!(
            handle.sent_lines(),
            vec![
                "{\"command\":\"restricted\"}\n",
                "{\"data\":1,\"notification\":\"giving-up\"}\n",
            ]
        );
        assert!(matches!(*fault.lock().unwrap(), Some(Fault::PeerClosed)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_error_without_error_callback_is_a_violation() {
        let (mut endpoint, _closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{\"error\":\"boom\"}\n"]));
        endpoint
            .send_command::<Value>("fragile", None, None, None)
            .unwrap();
        endpoint.run().await;

        match fault.lock().unwrap().take() {
            Some(Fault::Protocol(ProtocolViolation::MissingErrorCallback(name))) => {
                assert_eq!(name, "fragile");
            }
            other => panic!("expected missing-error-callback violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_inbound_command_is_a_violation() {
        // the handler never consumes its responder, so the first command
        // stays pending
        let registry =
            HandlerRegistry::new().command("job", |_wire: &mut Wire<'_>, _data, _responder| Ok(()));
        let (mut endpoint, _closes, fault) = observed_endpoint(registry);

        endpoint.bind(MockTransport::with_lines([
            "{\"command\":\"job\"}\n",
            "{\"command\":\"job\"}\n",
        ]));
        endpoint.run().await;

        assert!(matches!(
            *fault.lock().unwrap(),
            Some(Fault::Protocol(ProtocolViolation::CommandAlreadyPending))
        ));
    }

    #[tokio::test]
    async fn unknown_names_are_violations() {
        let (mut endpoint, _closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{\"command\":\"nope\"}\n"]));
        endpoint.run().await;
        match fault.lock().unwrap().take() {
            Some(Fault::Protocol(ProtocolViolation::UnknownCommand(name))) => {
                assert_eq!(name, "nope");
            }
            other => panic!("expected unknown-command violation, got {other:?}"),
        }

        let (mut endpoint, _closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{\"notification\":\"gone\"}\n"]));
        endpoint.run().await;
        assert!(matches!(
            fault.lock().unwrap().take(),
            Some(Fault::Protocol(ProtocolViolation::UnknownNotification(_)))
        ));
    }

    #[tokio::test]
    async fn hyphenated_wire_names_reach_underscore_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry = {
            let hits = Arc::clone(&hits);
            HandlerRegistry::new()
                .command("get_status", move |wire: &mut Wire<'_>, _data, responder| {
                    responder.reply(wire, json!("ok"))?;
                    Ok(())
                })
                .notification("peer-warning", move |_wire: &mut Wire<'_>, _data| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
        };
        let (mut endpoint, _closes, _fault) = observed_endpoint(registry);

        let transport = MockTransport::with_lines([
            "{\"notification\":\"peer-warning\"}\n",
            "{\"command\":\"get-status\"}\n",
        ]);
        let handle = transport.handle();
        endpoint.bind(transport);
        endpoint.run().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(handle.sent_lines(), vec!["{\"return\":\"ok\"}\n"]);
    }

    #[tokio::test]
    async fn malformed_line_reports_decode_fault_and_releases_once() {
        let (mut endpoint, closes, fault) = observed_endpoint(HandlerRegistry::new());
        let transport = MockTransport::with_lines(["not-json\n"]);
        let handle = transport.handle();
        endpoint.bind(transport);
        endpoint.run().await;

        assert!(matches!(
            *fault.lock().unwrap(),
            Some(Fault::Decode(DecodeError::Json(_)))
        ));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.close_count(), 1);
        assert!(handle.sent_lines().is_empty());
    }

    #[tokio::test]
    async fn handler_error_becomes_a_handler_fault() {
        let registry = HandlerRegistry::new()
            .command("blow-up", |_wire: &mut Wire<'_>, _data, _responder| {
                Err("boom".into())
            });
        let (mut endpoint, closes, fault) = observed_endpoint(registry);

        endpoint.bind(MockTransport::with_lines(["{\"command\":\"blow-up\"}\n"]));
        endpoint.run().await;

        match fault.lock().unwrap().take() {
            Some(Fault::Handler(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("expected handler fault, got {other:?}"),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notification_after_close_is_a_silent_no_op() {
        let (mut endpoint, closes, _fault) = observed_endpoint(HandlerRegistry::new());
        let transport = MockTransport::new();
        let handle = transport.handle();
        endpoint.bind(transport);

        endpoint.close(true);
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        endpoint
            .send_notification("status", Some(json!("late")))
            .unwrap();
        assert!(handle.sent_lines().is_empty());

        // commands are not silent: the caller is told
        assert!(matches!(
            endpoint.send_command::<Value>("late", None, None, None),
            Err(SendError::NotActive)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut endpoint, closes, _fault) = observed_endpoint(HandlerRegistry::new());
        let transport = MockTransport::new();
        let handle = transport.handle();
        endpoint.bind(transport);

        endpoint.close(true);
        endpoint.close(true);
        endpoint.close(false);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn deferred_close_completes_after_the_triggering_stack_unwinds() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = {
            let events = Arc::clone(&events);
            HandlerRegistry::new().notification("quit", move |wire: &mut Wire<'_>, _data| {
                events.lock().unwrap().push("handler");
                wire.close(false);
                assert_eq!(wire.state(), EndpointState::Closing);
                // writes stop the instant closing begins
                wire.send_notification("too-late", Some(json!(1)))?;
                events.lock().unwrap().push("handler end");
                Ok(())
            })
        };
        let mut endpoint = Endpoint::new(registry);
        {
            let events = Arc::clone(&events);
            endpoint.on_close(move || {
                events.lock().unwrap().push("closed");
            });
        }

        let transport = MockTransport::with_lines(["{\"notification\":\"quit\"}\n"]);
        let handle = transport.handle();
        endpoint.bind(transport);
        endpoint.run().await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["handler", "handler end", "closed"]
        );
        assert!(handle.sent_lines().is_empty());
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn immediate_close_runs_the_hook_inline() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = {
            let events = Arc::clone(&events);
            HandlerRegistry::new().notification("quit", move |wire: &mut Wire<'_>, _data| {
                events.lock().unwrap().push("handler");
                wire.close(true);
                events.lock().unwrap().push("handler end");
                Ok(())
            })
        };
        let mut endpoint = Endpoint::new(registry);
        {
            let events = Arc::clone(&events);
            endpoint.on_close(move || {
                events.lock().unwrap().push("closed");
            });
        }

        endpoint.bind(MockTransport::with_lines(["{\"notification\":\"quit\"}\n"]));
        endpoint.run().await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["handler", "closed", "handler end"]
        );
    }

    #[tokio::test]
    async fn close_hook_fires_exactly_once_per_trigger_kind() {
        // explicit deferred close, completed by the run loop
        let (mut endpoint, closes, _fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::new());
        endpoint.close(false);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        endpoint.run().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        endpoint.close(false);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // peer disconnect
        let (mut endpoint, closes, fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::new());
        endpoint.run().await;
        assert!(matches!(*fault.lock().unwrap(), Some(Fault::PeerClosed)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // internal fault
        let (mut endpoint, closes, _fault) = observed_endpoint(HandlerRegistry::new());
        endpoint.bind(MockTransport::with_lines(["{}\n"]));
        endpoint.run().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn responder_can_be_stashed_and_consumed_later() {
        let stashed: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(None));
        let registry = {
            let stash = Arc::clone(&stashed);
            let take = Arc::clone(&stashed);
            HandlerRegistry::new()
                .command("job", move |_wire: &mut Wire<'_>, _data, responder| {
                    *stash.lock().unwrap() = Some(responder);
                    Ok(())
                })
                .notification("flush", move |wire: &mut Wire<'_>, _data| {
                    let responder = take.lock().unwrap().take().expect("stashed responder");
                    responder.reply(wire, json!("done"))?;
                    Ok(())
                })
        };
        let (mut endpoint, _closes, _fault) = observed_endpoint(registry);

        let transport = MockTransport::with_lines([
            "{\"command\":\"job\"}\n",
            "{\"notification\":\"flush\"}\n",
        ]);
        let handle = transport.handle();
        endpoint.bind(transport);
        endpoint.run().await;

        assert_eq!(handle.sent_lines(), vec!["{\"return\":\"done\"}\n"]);
    }

    #[tokio::test]
    #[should_panic(expected = "fault raised while endpoint is")]
    async fn fault_after_scheduling_close_fails_fast() {
        let registry =
            HandlerRegistry::new().notification("quit", |wire: &mut Wire<'_>, _data| {
                wire.close(false);
                Err("kept going after close".into())
            });
        let mut endpoint = Endpoint::new(registry);
        endpoint.bind(MockTransport::with_lines(["{\"notification\":\"quit\"}\n"]));
        endpoint.run().await;
    }

    #[test]
    #[should_panic(expected = "endpoint is already bound")]
    fn binding_twice_fails_fast() {
        let mut endpoint = Endpoint::new(HandlerRegistry::new());
        endpoint.bind(MockTransport::new());
        endpoint.bind(MockTransport::new());
    }

    #[test]
    fn sends_before_bind_are_rejected() {
        let mut endpoint = Endpoint::new(HandlerRegistry::new());
        assert!(matches!(
            endpoint.send_command::<Value>("early", None, None, None),
            Err(SendError::NotActive)
        ));
        assert!(matches!(
            endpoint.send_notification::<Value>("early", None),
            Err(SendError::NotActive)
        ));
    }
}
