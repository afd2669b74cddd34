//! Integration tests for the two encryption schemes through the public API.
//!
//! Nostr public keys are x-only; the compressed form (with its real parity)
//! must agree with the x-only form for key agreement.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use nostr::{
    EncryptionScheme, Keys, Nip44Error, SchemePriority, decrypt_v2, encrypt_v2, nip04_decrypt,
    nip04_encrypt,
};

fn compressed_pubkey_hex(secret_key: &[u8; 32]) -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).expect("valid secret key");
    hex::encode(PublicKey::from_secret_key(&secp, &sk).serialize())
}

#[test]
fn test_nip44_roundtrip_with_compressed_and_xonly_keys() {
    let sender = Keys::generate();
    let recipient = Keys::generate();

    let plaintext = "Hello, Nostr! This is a test message for NIP-44 encryption.";

    let ciphertext = encrypt_v2(
        sender.secret_key(),
        &compressed_pubkey_hex(recipient.secret_key()),
        plaintext,
    )
    .expect("encryption should succeed");

    let decrypted = decrypt_v2(recipient.secret_key(), sender.public_key(), &ciphertext)
        .expect("decryption should succeed");

    assert_eq!(decrypted, plaintext);
}

#[test]
fn test_nip44_message_length_bounds() {
    let sender = Keys::generate();
    let recipient = Keys::generate();

    for plaintext in ["x".to_string(), "y".repeat(65535)] {
        let ciphertext = encrypt_v2(sender.secret_key(), recipient.public_key(), &plaintext)
            .expect("encryption should succeed");
        let decrypted = decrypt_v2(recipient.secret_key(), sender.public_key(), &ciphertext)
            .expect("decryption should succeed");
        assert_eq!(decrypted, plaintext);
    }

    let too_long = "z".repeat(65536);
    assert!(matches!(
        encrypt_v2(sender.secret_key(), recipient.public_key(), &too_long),
        Err(Nip44Error::InvalidPlaintextLength(65536))
    ));
}

#[test]
fn test_nip44_unicode() {
    let sender = Keys::generate();
    let recipient = Keys::generate();
    let plaintext = "Hello 世界 🌍 Привет";

    let ciphertext = encrypt_v2(sender.secret_key(), recipient.public_key(), plaintext).unwrap();
    let decrypted = decrypt_v2(recipient.secret_key(), sender.public_key(), &ciphertext).unwrap();
    assert_eq!(decrypted, plaintext);
}

#[test]
fn test_nip04_roundtrip() {
    let sender = Keys::generate();
    let recipient = Keys::generate();

    let ciphertext = nip04_encrypt(sender.secret_key(), recipient.public_key(), "legacy").unwrap();
    let decrypted = nip04_decrypt(recipient.secret_key(), sender.public_key(), &ciphertext).unwrap();
    assert_eq!(decrypted, "legacy");
}

#[test]
fn test_schemes_do_not_accept_each_others_payloads() {
    let sender = Keys::generate();
    let recipient = Keys::generate();

    let v2 = encrypt_v2(sender.secret_key(), recipient.public_key(), "modern").unwrap();
    assert!(nip04_decrypt(recipient.secret_key(), sender.public_key(), &v2).is_err());

    let v1 = nip04_encrypt(sender.secret_key(), recipient.public_key(), "legacy").unwrap();
    assert!(decrypt_v2(recipient.secret_key(), sender.public_key(), &v1).is_err());
}

#[test]
fn test_priority_list_switches_after_fallback() {
    let sender = Keys::generate();
    let recipient = Keys::generate();
    let mut priority = SchemePriority::dual();

    let v1 = EncryptionScheme::Nip04
        .encrypt(sender.secret_key(), recipient.public_key(), "first")
        .unwrap();
    let (text, used) = priority
        .decrypt(recipient.secret_key(), sender.public_key(), &v1)
        .unwrap();
    assert_eq!((text.as_str(), used), ("first", EncryptionScheme::Nip04));
    assert_eq!(priority.preferred(), EncryptionScheme::Nip04);

    let v2 = EncryptionScheme::Nip44
        .encrypt(sender.secret_key(), recipient.public_key(), "second")
        .unwrap();
    let (text, used) = priority
        .decrypt(recipient.secret_key(), sender.public_key(), &v2)
        .unwrap();
    assert_eq!((text.as_str(), used), ("second", EncryptionScheme::Nip44));
    assert_eq!(priority.preferred(), EncryptionScheme::Nip44);
}
