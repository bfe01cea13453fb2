//! Encrypted chat over the data channel with delivery acknowledgements.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::context::{Role, SessionContext};
use crate::engine::DataChannel;
use crate::error::{CipherError, DecryptionError, RelayError};
use crate::protocol::{ChatMessageEnvelope, MessageId, PeerMessage};

/// Payload encryption, supplied by the host application and keyed by the
/// session token.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, session_token: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, session_token: &str, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub text: String,
    pub timestamp: i64,
    pub sender_role: Role,
}

pub struct MessageRelay {
    token: String,
    local_role: Role,
    cipher: Arc<dyn Cipher>,
    /// Sent messages still waiting for their ack.
    outstanding: HashSet<MessageId>,
}

impl MessageRelay {
    pub fn new(context: &SessionContext, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            token: context.token.clone(),
            local_role: context.role,
            cipher,
            outstanding: HashSet::new(),
        }
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.outstanding.contains(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.outstanding.len()
    }

    pub async fn send(
        &mut self,
        channel: &dyn DataChannel,
        plaintext: &str,
    ) -> Result<MessageId, RelayError> {
        if !channel.is_open() {
            return Err(RelayError::ChannelNotOpen);
        }
        let ciphertext = self.cipher.encrypt(&self.token, plaintext.as_bytes())?;
        let message_id = Uuid::new_v4();
        let envelope = ChatMessageEnvelope {
            message_id,
            ciphertext: BASE64.encode(ciphertext),
            timestamp: unix_millis(),
            sender_role: self.local_role,
        };
        let text = PeerMessage::Message(envelope)
            .to_text()
            .map_err(|err| RelayError::Encode {
                message_id,
                reason: err.to_string(),
            })?;
        channel.send_text(text).await.map_err(RelayError::Send)?;
        self.outstanding.insert(message_id);
        tracing::debug!(target: "parley::relay", %message_id, "chat message sent");
        Ok(message_id)
    }

    /// Decrypts an inbound envelope. The caller acknowledges it on success.
    pub fn on_receive(
        &self,
        envelope: &ChatMessageEnvelope,
    ) -> Result<ReceivedMessage, DecryptionError> {
        let ciphertext = BASE64
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|err| DecryptionError(format!("invalid base64: {err}")))?;
        let plaintext = self.cipher.decrypt(&self.token, &ciphertext)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| DecryptionError("plaintext is not utf-8".into()))?;
        Ok(ReceivedMessage {
            message_id: envelope.message_id,
            text,
            timestamp: envelope.timestamp,
            sender_role: envelope.sender_role,
        })
    }

    pub fn ack_for(message: &ReceivedMessage) -> PeerMessage {
        PeerMessage::Ack {
            message_id: message.message_id,
        }
    }

    /// Returns `true` if this ack confirmed one of our pending messages.
    /// The message is forgotten, so a repeated ack is unmatched.
    pub fn on_ack(&mut self, message_id: MessageId) -> bool {
        if self.outstanding.remove(&message_id) {
            tracing::debug!(target: "parley::relay", %message_id, "chat message delivered");
            true
        } else {
            tracing::debug!(target: "parley::relay", %message_id, "ignoring unmatched ack");
            false
        }
    }

    /// Forgets every tracked message, e.g. after the peer connection was
    /// rebuilt.
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// XOR with the token bytes, prefixed by a marker so tampering is caught.
    struct XorCipher;

    impl Cipher for XorCipher {
        fn encrypt(&self, token: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
            let key = token.as_bytes();
            let mut out = b"ok:".to_vec();
            out.extend(plaintext.iter().enumerate().map(|(i, b)| b ^ key[i % key.len()]));
            Ok(out)
        }

        fn decrypt(&self, token: &str, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
            let body = ciphertext
                .strip_prefix(b"ok:")
                .ok_or_else(|| DecryptionError("bad marker".into()))?;
            let key = token.as_bytes();
            Ok(body
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % key.len()])
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        open: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            "chat"
        }

        fn is_open(&self) -> bool {
            self.open
        }

        async fn send_text(&self, text: String) -> Result<(), EngineError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&self) {}
    }

    fn relay(role: Role) -> MessageRelay {
        MessageRelay::new(
            &SessionContext::new("token-T", format!("{role}"), role),
            Arc::new(XorCipher),
        )
    }

    fn envelope_of(text: &str) -> ChatMessageEnvelope {
        match PeerMessage::from_text(text).unwrap() {
            PeerMessage::Message(envelope) => envelope,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_receive_and_ack() {
        let mut host = relay(Role::Host);
        let guest = relay(Role::Guest);
        let channel = RecordingChannel {
            open: true,
            ..Default::default()
        };

        let id = host.send(&channel, "hello").await.unwrap();
        assert!(host.is_pending(&id));

        let wire = channel.sent.lock()[0].clone();
        let envelope = envelope_of(&wire);
        assert_eq!(envelope.message_id, id);
        assert_eq!(envelope.sender_role, Role::Host);
        assert!(!envelope.ciphertext.contains("hello"));

        let received = guest.on_receive(&envelope).unwrap();
        assert_eq!(received.text, "hello");
        let ack = MessageRelay::ack_for(&received);
        assert_eq!(ack, PeerMessage::Ack { message_id: id });

        assert!(host.on_ack(id));
        assert!(!host.on_ack(id));
        assert!(!host.is_pending(&id));
    }

    #[tokio::test]
    async fn acknowledged_messages_are_released() {
        let mut host = relay(Role::Host);
        let channel = RecordingChannel {
            open: true,
            ..Default::default()
        };
        let mut ids = Vec::new();
        for index in 0..200 {
            ids.push(host.send(&channel, &format!("m{index}")).await.unwrap());
        }
        assert_eq!(host.pending_count(), 200);

        for id in &ids[..150] {
            assert!(host.on_ack(*id));
        }
        assert_eq!(host.pending_count(), 50);
        for id in ids {
            host.on_ack(id);
        }
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let mut host = relay(Role::Host);
        let channel = RecordingChannel::default();
        assert_eq!(
            host.send(&channel, "hello").await,
            Err(RelayError::ChannelNotOpen)
        );
    }

    #[tokio::test]
    async fn message_ids_are_unique() {
        let mut host = relay(Role::Host);
        let channel = RecordingChannel {
            open: true,
            ..Default::default()
        };
        let first = host.send(&channel, "a").await.unwrap();
        let second = host.send(&channel, "a").await.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_envelope_fails_alone() {
        let guest = relay(Role::Guest);
        let envelope = ChatMessageEnvelope {
            message_id: Uuid::new_v4(),
            ciphertext: BASE64.encode(b"garbage"),
            timestamp: 0,
            sender_role: Role::Host,
        };
        assert!(guest.on_receive(&envelope).is_err());

        let not_base64 = ChatMessageEnvelope {
            ciphertext: "***".into(),
            ..envelope
        };
        assert!(guest.on_receive(&not_base64).is_err());
    }

    #[test]
    fn unknown_ack_is_ignored() {
        let mut host = relay(Role::Host);
        assert!(!host.on_ack(Uuid::new_v4()));
        host.clear();
    }
}
