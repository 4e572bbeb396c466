//! Key and certificate fixtures shared by unit tests.
use rsa::{
    RsaPrivateKey,
    pkcs1v15::{Signature, SigningKey},
};
use sha2::Sha256;
use std::{str::FromStr, sync::OnceLock, time::Duration};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

pub(crate) fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key"))
}

pub(crate) fn other_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key"))
}

pub(crate) fn self_signed(key: &RsaPrivateKey, serial: u32, lifetime: Duration) -> Certificate {
    let signer = SigningKey::<Sha256>::new(key.clone());
    let spki = SubjectPublicKeyInfoOwned::from_key(key.to_public_key()).expect("spki");
    let subject = Name::from_str("CN=EGS1-886431145,O=Acme Trading,C=SA").expect("subject");
    CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(serial),
        Validity::from_now(lifetime).expect("validity"),
        subject,
        spki,
        &signer,
    )
    .expect("certificate builder")
    .build::<Signature>()
    .expect("certificate")
}

pub(crate) fn test_certificate() -> &'static Certificate {
    static CERT: OnceLock<Certificate> = OnceLock::new();
    CERT.get_or_init(|| self_signed(test_key(), 4242, Duration::from_secs(3600)))
}
