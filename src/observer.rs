//! The callback surface a Connection drives as it processes frames.
//!
//! The source material assigns callback fields directly; here each
//! Connection is constructed with a `ConnectionObserver` trait object
//! instead, and the only observer implementation (`RouterObserver`) forwards
//! into the Router's command channel. A Connection never holds a reference
//! to the Router itself — only to this observer — which breaks the
//! Router/Connection reference cycle described in the design notes.

use relay_protocol::{AckPayload, Envelope};
use relay_storage::ClosedBy;

use crate::connection::{ConnId, ConnectionHandle};

/// Session facts reported on the HANDSHAKING -> ACTIVE transition.
#[derive(Clone)]
pub struct ActiveSession {
    pub session_id: String,
    pub resume_token: String,
    pub is_resumed: bool,
    /// The Connection's own handle, so the observer can register it with
    /// the Router — this is the only place a live Connection's handle
    /// reaches anything outside `connection.rs`.
    pub handle: ConnectionHandle,
}

pub trait ConnectionObserver: Send + Sync {
    fn on_active(&self, conn_id: ConnId, agent: &str, session: ActiveSession);
    fn on_message(&self, conn_id: ConnId, agent: &str, envelope: Envelope);
    fn on_ack(&self, conn_id: ConnId, agent: &str, ack: AckPayload);
    fn on_pong(&self, conn_id: ConnId, agent: &str);
    fn on_backpressure(&self, conn_id: ConnId, agent: &str, active: bool);
    fn on_close(&self, conn_id: ConnId, agent: Option<&str>, closed_by: ClosedBy);
    fn on_error(&self, conn_id: ConnId, agent: Option<&str>, message: &str);
}
