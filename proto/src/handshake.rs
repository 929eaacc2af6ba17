//! Connection establishment state machine.
//!
//! Sequence: the dialer opens with `SChannelInitiate`, the acceptor answers
//! `SChannelReady`, and both sides derive the session key from the X25519
//! exchange. Each side then proves its long-term identity with
//! `Authentication` (an Ed25519 signature over the channel binding) and
//! exchanges `Login` capabilities. Once both are received the connection is
//! `Active`.
//!
//! The machine is sans-IO: callers feed inbound messages to [`Handshake::on_msg`]
//! and send whatever it returns. Sealing rule for the transport layer: every
//! frame except `SChannelInitiate` / `SChannelReady` is sealed with the
//! session cipher once [`Handshake::session_key`] is available.

use std::sync::Arc;

use mist_crypto::schannel::{channel_binding, ChannelKeys};
use mist_crypto::{sign_message, verify_signature};
use mist_types::{KeyPair, NodeId, PublicKey};

use crate::error::ProtoError;
use crate::flags::IdType;
use crate::messages::{Authentication, Login, NodeMsg, SChannelInitiate, SChannelReady};

/// Connection lifecycle states.
///
/// The handshake machine drives `Dialing`, `HandshakingSecure`,
/// `HandshakingAuth`, then `Active`; `Draining` and `Closed` are entered by the
/// owning connection when it shuts down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Dialing,
    HandshakingSecure,
    HandshakingAuth,
    Active,
    Draining,
    Closed,
}

impl ConnState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Dialing => "Dialing",
            ConnState::HandshakingSecure => "HandshakingSecure",
            ConnState::HandshakingAuth => "HandshakingAuth",
            ConnState::Active => "Active",
            ConnState::Draining => "Draining",
            ConnState::Closed => "Closed",
        }
    }
}

pub struct Handshake {
    state: ConnState,
    initiator: bool,
    keys: ChannelKeys,
    session_key: Option<[u8; 32]>,
    binding: Option<[u8; 32]>,
    identity: Arc<KeyPair>,
    our_login: Login,
    remote_id: Option<NodeId>,
    remote_id_type: Option<IdType>,
    remote_login: Option<Login>,
}

impl Handshake {
    pub fn new(initiator: bool, identity: Arc<KeyPair>, our_login: Login) -> Self {
        Self::with_channel_keys(initiator, identity, our_login, ChannelKeys::generate())
    }

    /// Deterministic construction for tests.
    pub fn with_channel_keys(
        initiator: bool,
        identity: Arc<KeyPair>,
        our_login: Login,
        keys: ChannelKeys,
    ) -> Self {
        Self {
            state: if initiator {
                ConnState::Dialing
            } else {
                ConnState::HandshakingSecure
            },
            initiator,
            keys,
            session_key: None,
            binding: None,
            identity,
            our_login,
            remote_id: None,
            remote_id_type: None,
            remote_login: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    /// The derived session key, available once the secure phase completed.
    pub fn session_key(&self) -> Option<[u8; 32]> {
        self.session_key
    }

    /// The authenticated remote identity, available once `Active`.
    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote_id
    }

    /// What kind of key the remote proved control of.
    pub fn remote_id_type(&self) -> Option<IdType> {
        self.remote_id_type
    }

    pub fn remote_login(&self) -> Option<&Login> {
        self.remote_login.as_ref()
    }

    /// Kick off the exchange. The dialer emits `SChannelInitiate`; the
    /// acceptor waits.
    pub fn start(&mut self) -> Vec<NodeMsg> {
        if self.initiator && self.state == ConnState::Dialing {
            self.state = ConnState::HandshakingSecure;
            vec![SChannelInitiate {
                ephemeral: self.keys.public(),
            }
            .into()]
        } else {
            Vec::new()
        }
    }

    /// Feed one inbound message; returns the messages to send in response.
    pub fn on_msg(&mut self, msg: &NodeMsg) -> Result<Vec<NodeMsg>, ProtoError> {
        match (self.state, msg) {
            (ConnState::HandshakingSecure, NodeMsg::SChannelInitiate(m)) if !self.initiator => {
                self.establish(&m.ephemeral);
                let mut out = vec![SChannelReady {
                    ephemeral: self.keys.public(),
                }
                .into()];
                out.push(self.make_auth().into());
                out.push(self.our_login.clone().into());
                Ok(out)
            }
            (ConnState::HandshakingSecure, NodeMsg::SChannelReady(m)) if self.initiator => {
                self.establish(&m.ephemeral);
                Ok(vec![self.make_auth().into(), self.our_login.clone().into()])
            }
            (ConnState::HandshakingAuth, NodeMsg::Authentication(m)) => {
                let binding = self.binding.expect("auth state implies binding");
                if !verify_signature(&binding, &m.signature, &PublicKey(m.node_id.0)) {
                    return Err(ProtoError::AuthFailed);
                }
                self.remote_id = Some(m.node_id);
                self.remote_id_type = Some(m.id_type);
                self.maybe_activate();
                Ok(Vec::new())
            }
            (ConnState::HandshakingAuth, NodeMsg::Login(m)) => {
                self.remote_login = Some(m.clone());
                self.maybe_activate();
                Ok(Vec::new())
            }
            (state, other) => Err(ProtoError::UnexpectedMessage {
                got: other.name(),
                state: state.name(),
            }),
        }
    }

    fn establish(&mut self, remote_eph: &[u8; 32]) {
        self.session_key = Some(self.keys.agree(remote_eph));
        let ours = self.keys.public();
        self.binding = Some(if self.initiator {
            channel_binding(&ours, remote_eph)
        } else {
            channel_binding(remote_eph, &ours)
        });
        self.state = ConnState::HandshakingAuth;
    }

    fn make_auth(&self) -> Authentication {
        let binding = self.binding.expect("establish ran first");
        Authentication {
            node_id: NodeId(self.identity.public.0),
            id_type: IdType::Node,
            signature: sign_message(&binding, &self.identity.private),
        }
    }

    fn maybe_activate(&mut self) {
        if self.remote_id.is_some() && self.remote_login.is_some() {
            self.state = ConnState::Active;
        }
    }
}
