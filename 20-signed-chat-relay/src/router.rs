//! Protocol state machine.
//!
//! A sender is Unjoined until a valid `join` binds its endpoint to a name in
//! the registry, Joined while that binding exists, and Closed once it leaves
//! or disconnects. Only the registry records the state; the router derives
//! it from the sender's endpoint on every envelope.

use tracing::{debug, info, warn};

use crate::{
    codec::Codec,
    delivery::{Delivery, Outbox},
    error::{CodecError, DeliveryError},
    message::{Body, Command, Envelope},
    registry::{ConnectionId, Endpoint, Registry},
};

pub const NO_SUCH_USER: &str = "No such user";
pub const EMPTY_NAME: &str = "Name must not be empty";
pub const NAME_TAKEN: &str = "Name already in use";
pub const ALREADY_JOINED: &str = "Already joined";
pub const INVALID_SIGNATURE: &str = "Invalid signature";
pub const MESSAGE_TOO_LARGE: &str = "Message too large";

/// What routing one envelope did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Joined { name: String },
    Rejected(Rejection),
    Broadcast { from: String, recipients: usize },
    Listed { requester: String },
    Whispered { from: String, to: String },
    WhisperFailed { from: String, to: String },
    Left { name: String },
    /// Dropped without reply: pre-join traffic, relay-only shapes sent by a
    /// client, or a disconnect from an endpoint that never joined.
    Ignored,
}

/// Reasons a sender got an `err` reply with no state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InvalidSignature,
    EmptyName,
    NameTaken(String),
    AlreadyJoined,
    /// The relayed form would not fit in one frame.
    TooLarge,
}

#[derive(Debug)]
pub struct Routed {
    pub action: Action,
    /// Stream connections whose sends failed and must be torn down.
    pub teardown: Vec<ConnectionId>,
}

pub struct Router {
    codec: Codec,
    registry: Registry,
}

impl Router {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            registry: Registry::new(),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Verifies `envelope` from `from` and applies its effect.
    pub fn route<O: Outbox>(
        &mut self,
        from: Endpoint,
        envelope: Envelope,
        outbox: &mut O,
    ) -> Result<Routed, CodecError> {
        let (codec, registry) = (&self.codec, &mut self.registry);
        let mut delivery = Delivery::new(codec, outbox);

        if !codec.verify(&envelope) {
            warn!(%from, kind = envelope.kind(), "rejecting envelope with invalid signature");
            delivery.send_to(from, &Envelope::error(INVALID_SIGNATURE))?;
            return Ok(Routed {
                action: Action::Rejected(Rejection::InvalidSignature),
                teardown: delivery.into_failures(),
            });
        }

        let sender = registry.identity_of(&from).map(str::to_owned);
        let action = match (sender, envelope.body) {
            (None, Body::Join { name }) => {
                let name = name.trim();
                if name.is_empty() {
                    delivery.send_to(from, &Envelope::error(EMPTY_NAME))?;
                    Action::Rejected(Rejection::EmptyName)
                } else if !registry.register(name, from) {
                    delivery.send_to(from, &Envelope::error(NAME_TAKEN))?;
                    Action::Rejected(Rejection::NameTaken(name.to_string()))
                } else {
                    info!(%from, %name, "identity joined");
                    let notice = Envelope::notice(format!("{name} joined"));
                    delivery.broadcast(registry, &notice, None)?;
                    Action::Joined {
                        name: name.to_string(),
                    }
                }
            }
            (None, body) => {
                debug!(%from, ?body, "dropping envelope from unjoined sender");
                Action::Ignored
            }
            (Some(_), Body::Join { .. }) => {
                delivery.send_to(from, &Envelope::error(ALREADY_JOINED))?;
                Action::Rejected(Rejection::AlreadyJoined)
            }
            (Some(name), Body::Msg { text, .. }) => {
                let chat = Envelope::stamped(Body::Msg {
                    name: Some(name.clone()),
                    text,
                });
                match delivery.broadcast(registry, &chat, Some(from)) {
                    Ok(recipients) => Action::Broadcast {
                        from: name,
                        recipients,
                    },
                    Err(CodecError::FrameTooLarge { len, .. }) => {
                        debug!(%from, %name, len, "refusing oversized chat");
                        delivery.send_to(from, &Envelope::error(MESSAGE_TOO_LARGE))?;
                        Action::Rejected(Rejection::TooLarge)
                    }
                    Err(error) => return Err(error),
                }
            }
            (Some(name), Body::Cmd(Command::List)) => {
                let roster = Envelope::stamped(Body::List {
                    users: registry.roster(),
                });
                delivery.send_to(from, &roster)?;
                Action::Listed { requester: name }
            }
            (Some(name), Body::Cmd(Command::Whisper { to, text })) => {
                let whisper = Envelope::stamped(Body::Whisper {
                    from: name.clone(),
                    text,
                });
                match delivery.unicast(registry, &to, &whisper) {
                    Ok(()) => Action::Whispered { from: name, to },
                    Err(DeliveryError::UnknownRecipient(_)) => {
                        delivery.send_to(from, &Envelope::error(NO_SUCH_USER))?;
                        Action::WhisperFailed { from: name, to }
                    }
                    Err(DeliveryError::Codec(CodecError::FrameTooLarge { len, .. })) => {
                        debug!(%from, %name, len, "refusing oversized whisper");
                        delivery.send_to(from, &Envelope::error(MESSAGE_TOO_LARGE))?;
                        Action::Rejected(Rejection::TooLarge)
                    }
                    Err(DeliveryError::Codec(error)) => return Err(error),
                }
            }
            (Some(name), Body::Leave) => {
                registry.unregister(&name);
                info!(%from, %name, "identity left");
                let notice = Envelope::notice(format!("{name} left"));
                delivery.broadcast(registry, &notice, None)?;
                Action::Left { name }
            }
            (
                Some(name),
                body @ (Body::Sys { .. } | Body::Err { .. } | Body::List { .. } | Body::Whisper { .. }),
            ) => {
                debug!(%from, %name, ?body, "dropping relay-only envelope sent by a client");
                Action::Ignored
            }
        };

        Ok(Routed {
            action,
            teardown: delivery.into_failures(),
        })
    }

    /// Forgets whatever identity `endpoint` held and tells the others.
    pub fn disconnect<O: Outbox>(
        &mut self,
        endpoint: Endpoint,
        outbox: &mut O,
    ) -> Result<Routed, CodecError> {
        let (codec, registry) = (&self.codec, &mut self.registry);
        let mut delivery = Delivery::new(codec, outbox);

        let action = match registry.identity_of(&endpoint).map(str::to_owned) {
            Some(name) => {
                registry.unregister(&name);
                info!(%endpoint, %name, "identity disconnected");
                let notice = Envelope::notice(format!("{name} left"));
                delivery.broadcast(registry, &notice, None)?;
                Action::Left { name }
            }
            None => Action::Ignored,
        };

        Ok(Routed {
            action,
            teardown: delivery.into_failures(),
        })
    }
}
