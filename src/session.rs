//! Secure session: KEM handshake followed by encrypted, framed messages
//!
//! One session per TCP connection:
//!
//! ```text
//! initiator                               responder
//!   generate keypair
//!   public key (raw, fixed size)  ───────▶
//!                                          encapsulate(public key)
//!                                 ◀─────── ciphertext (raw, fixed size)
//!   decapsulate(ciphertext)
//!   [len][IV || AES-CBC(message)] ◀──────▶ [len][IV || AES-CBC(message)]
//! ```
//!
//! The session does not own the stream; callers pass it to every call.

use crate::crypto::{self, KemProvider, SessionKey};
use crate::framing;
use crate::QstpError;
use tokio::io::{AsyncRead, AsyncWrite};

/// Established session holding the shared key of one connection
#[derive(Debug)]
pub struct SecureSession {
    key: SessionKey,
}

impl SecureSession {
    /// Run the initiator (client) side of the handshake.
    pub async fn initiate<S>(stream: &mut S, kem: &dyn KemProvider) -> Result<Self, QstpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keypair = kem.generate_keypair();
        log::trace!(
            "sending KEM public key {}..",
            hex::encode(&keypair.public_key[..8.min(keypair.public_key.len())])
        );
        framing::write_raw(stream, &keypair.public_key).await?;

        let ciphertext = framing::read_exact_message(stream, kem.ciphertext_len())
            .await
            .map_err(handshake_eof)?;
        let key = kem.decapsulate(&ciphertext, &keypair.secret_key)?;

        Ok(Self { key })
    }

    /// Run the responder (server) side of the handshake.
    pub async fn respond<S>(stream: &mut S, kem: &dyn KemProvider) -> Result<Self, QstpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let public_key = framing::read_exact_message(stream, kem.public_key_len())
            .await
            .map_err(handshake_eof)?;
        log::trace!("received KEM public key {}..", hex::encode(&public_key[..8]));

        let (ciphertext, key) = kem.encapsulate(&public_key)?;
        framing::write_raw(stream, &ciphertext).await?;

        Ok(Self { key })
    }

    /// Encrypt `message` and send it as one frame.
    pub async fn send<S>(&self, stream: &mut S, message: &[u8]) -> Result<(), QstpError>
    where
        S: AsyncWrite + Unpin,
    {
        let sealed = crypto::encrypt(&self.key, message)?;
        framing::write_frame(stream, &sealed).await
    }

    /// Receive one frame and decrypt it.
    pub async fn receive<S>(&self, stream: &mut S) -> Result<Vec<u8>, QstpError>
    where
        S: AsyncRead + Unpin,
    {
        let sealed = framing::read_frame(stream).await?;
        crypto::decrypt(&self.key, &sealed)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

fn handshake_eof(e: QstpError) -> QstpError {
    match e {
        QstpError::ConnectionClosed(_) => QstpError::ConnectionClosed("handshake"),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KemAlgorithm;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_handshake_keys_agree() {
        let (mut client_stream, mut server_stream) = duplex(8192);
        let kem = KemAlgorithm::MlKem512;

        let client = tokio::spawn(async move {
            let session = SecureSession::initiate(&mut client_stream, &kem).await.unwrap();
            (session, client_stream)
        });
        let server = tokio::spawn(async move {
            let session = SecureSession::respond(&mut server_stream, &kem).await.unwrap();
            (session, server_stream)
        });

        let (client_session, mut client_stream) = client.await.unwrap();
        let (server_session, mut server_stream) = server.await.unwrap();
        assert_eq!(client_session.key().as_bytes(), server_session.key().as_bytes());

        client_session.send(&mut client_stream, b"ping").await.unwrap();
        assert_eq!(server_session.receive(&mut server_stream).await.unwrap(), b"ping");

        server_session.send(&mut server_stream, b"pong").await.unwrap();
        assert_eq!(client_session.receive(&mut client_stream).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_responder_fails_on_short_public_key() {
        let (mut client_stream, mut server_stream) = duplex(8192);
        client_stream.write_all(&[1u8; 100]).await.unwrap();
        drop(client_stream);

        let err = SecureSession::respond(&mut server_stream, &KemAlgorithm::MlKem512)
            .await
            .unwrap_err();
        assert!(matches!(err, QstpError::ConnectionClosed("handshake")));
    }

    #[tokio::test]
    async fn test_initiator_fails_when_peer_hangs_up() {
        let (mut client_stream, server_stream) = duplex(8192);
        drop(server_stream);

        let err = SecureSession::initiate(&mut client_stream, &KemAlgorithm::MlKem512)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
