//! Test the KEM handshake and encrypted framing over in-memory streams

use qstp::crypto::{self, KemAlgorithm, KemProvider, IV_LEN};
use qstp::framing;
use qstp::{QstpError, SecureSession};
use tokio::io::{duplex, AsyncReadExt};

async fn establish(kem: KemAlgorithm) {
    let (mut client_stream, mut server_stream) = duplex(65536);

    let client_handle = tokio::spawn(async move {
        let session = SecureSession::initiate(&mut client_stream, &kem)
            .await
            .expect("Client handshake should succeed");

        session
            .send(&mut client_stream, b"Hello from client!")
            .await
            .expect("Client write should succeed");
        let reply = session
            .receive(&mut client_stream)
            .await
            .expect("Client read should succeed");
        assert_eq!(&reply, b"Hello from server!");

        session.key().as_bytes().to_vec()
    });

    let server_handle = tokio::spawn(async move {
        let session = SecureSession::respond(&mut server_stream, &kem)
            .await
            .expect("Server handshake should succeed");

        let request = session
            .receive(&mut server_stream)
            .await
            .expect("Server read should succeed");
        assert_eq!(&request, b"Hello from client!");

        session
            .send(&mut server_stream, b"Hello from server!")
            .await
            .expect("Server write should succeed");

        session.key().as_bytes().to_vec()
    });

    let client_key = client_handle.await.unwrap();
    let server_key = server_handle.await.unwrap();
    assert_eq!(client_key, server_key, "{} peers derived different keys", kem);
}

#[tokio::test]
async fn test_handshake_all_parameter_sets() {
    for kem in [
        KemAlgorithm::MlKem512,
        KemAlgorithm::MlKem768,
        KemAlgorithm::MlKem1024,
    ] {
        establish(kem).await;
    }
}

#[tokio::test]
async fn test_handshake_wire_sizes() {
    let kem = KemAlgorithm::MlKem512;
    let (mut client_stream, mut server_stream) = duplex(65536);

    let client = tokio::spawn(async move {
        SecureSession::initiate(&mut client_stream, &kem).await.unwrap();
    });

    // Public key arrives raw, with no length prefix.
    let public_key = framing::read_exact_message(&mut server_stream, kem.public_key_len())
        .await
        .unwrap();
    assert_eq!(public_key.len(), 800);

    let (ciphertext, _key) = kem.encapsulate(&public_key).unwrap();
    assert_eq!(ciphertext.len(), 768);
    framing::write_raw(&mut server_stream, &ciphertext).await.unwrap();

    client.await.unwrap();

    let mut leftover = Vec::new();
    server_stream.read_to_end(&mut leftover).await.unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn test_secure_message_layout() {
    let kem = KemAlgorithm::default();
    let (mut client_stream, mut server_stream) = duplex(65536);

    let server = tokio::spawn(async move {
        let session = SecureSession::respond(&mut server_stream, &kem).await.unwrap();
        let sealed = framing::read_frame(&mut server_stream).await.unwrap();
        (session, sealed)
    });

    let session = SecureSession::initiate(&mut client_stream, &kem).await.unwrap();
    session.send(&mut client_stream, b"0123456789").await.unwrap();

    let (server_session, sealed) = server.await.unwrap();
    // IV plus one padded block
    assert_eq!(sealed.len(), IV_LEN + 16);
    assert_eq!(
        crypto::decrypt(server_session.key(), &sealed).unwrap(),
        b"0123456789"
    );
}

#[tokio::test]
async fn test_mismatched_kem_fails() {
    let (mut client_stream, mut server_stream) = duplex(65536);

    let client = tokio::spawn(async move {
        SecureSession::initiate(&mut client_stream, &KemAlgorithm::MlKem768).await
    });

    // A 512 responder reads only 800 of the 1184 public key bytes, so the
    // 768 initiator never sees a full 1088-byte ciphertext.
    let _ = SecureSession::respond(&mut server_stream, &KemAlgorithm::MlKem512).await;
    drop(server_stream);

    let err = client.await.unwrap().unwrap_err();
    assert!(matches!(err, QstpError::ConnectionClosed("handshake")));
}
