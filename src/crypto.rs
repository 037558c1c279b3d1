// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Keys, signatures and hashes. Every node owns a [`KeyRing`] whose public part, the
//! [`PubKeyRing`], identifies it in offers, trades, witnesses and disputes. Signatures are ECDSA
//! over secp256k1, DER encoded, computed on the SHA256 digest of the signed data.

use std::error;
use std::fmt;
use std::io;

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use rand::RngCore;
use thiserror::Error;

use crate::consensus::{self, CanonicalBytes, Decodable, Encodable};

/// List of cryptographic errors that can be encountered when signing, verifying or parsing keys.
#[derive(Error, Debug)]
pub enum Error {
    /// The key does not parse.
    #[error("The key is not a valid secp256k1 key")]
    InvalidKey,
    /// The signature does not parse.
    #[error("The signature is not a valid DER signature")]
    MalformedSignature,
    /// The signature does not pass the validation tests.
    #[error("The signature does not pass the validation")]
    InvalidSignature,
    /// Any cryptographic error not part of this list.
    #[error("Cryptographic error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new cryptographic error of type [`Self::Other`] with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Consumes the `Error`, returning its inner error (if any).
    ///
    /// If this [`enum@Error`] was constructed via [`new`] then this function will return [`Some`],
    /// otherwise it will return [`None`].
    ///
    /// [`new`]: Error::new
    ///
    pub fn into_inner(self) -> Option<Box<dyn error::Error + Send + Sync>> {
        match self {
            Self::Other(error) => Some(error),
            _ => None,
        }
    }
}

/// `RIPEMD160(SHA256(data))`.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).into_inner()
}

/// `SHA256(data)`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).into_inner()
}

fn digest(data: &[u8]) -> Result<Message, Error> {
    Message::from_slice(&sha256(data)).map_err(Error::new)
}

/// Verify a DER encoded signature of `data` against a serialized public key.
pub fn verify(pub_key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), Error> {
    let pub_key = PublicKey::from_slice(pub_key).map_err(|_| Error::InvalidKey)?;
    let signature = ecdsa::Signature::from_der(signature).map_err(|_| Error::MalformedSignature)?;
    Secp256k1::verification_only()
        .verify_ecdsa(&digest(data)?, &signature, &pub_key)
        .map_err(|_| Error::InvalidSignature)
}

/// Public identity of a node: its signature public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKeyRing {
    signature_pub_key: PublicKey,
}

impl PubKeyRing {
    pub fn new(signature_pub_key: PublicKey) -> Self {
        Self { signature_pub_key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::new(
            PublicKey::from_slice(bytes).map_err(|_| Error::InvalidKey)?,
        ))
    }

    pub fn signature_pub_key(&self) -> &PublicKey {
        &self.signature_pub_key
    }

    /// Compressed serialization of the signature key, the bytes committed in witness hashes.
    pub fn signature_pub_key_bytes(&self) -> Vec<u8> {
        self.signature_pub_key.serialize().to_vec()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), Error> {
        verify(&self.signature_pub_key_bytes(), data, signature)
    }
}

impl fmt::Debug for PubKeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PubKeyRing({})",
            hex::encode(self.signature_pub_key.serialize())
        )
    }
}

impl fmt::Display for PubKeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short fingerprint for logs
        write!(f, "{}", &hex::encode(self.signature_pub_key.serialize())[..16])
    }
}

impl CanonicalBytes for PubKeyRing {
    fn as_canonical_bytes(&self) -> Vec<u8> {
        self.signature_pub_key_bytes()
    }

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, consensus::Error> {
        Self::from_bytes(bytes).map_err(consensus::Error::new)
    }
}

impl Encodable for PubKeyRing {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.signature_pub_key.serialize().consensus_encode(writer)
    }
}

impl Decodable for PubKeyRing {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let bytes: [u8; 33] = Decodable::consensus_decode(d)?;
        Self::from_canonical_bytes(&bytes)
    }
}

impl_strict_encoding!(PubKeyRing);

/// Private keys of a node.
#[derive(Clone)]
pub struct KeyRing {
    signature_key: SecretKey,
    pub_key_ring: PubKeyRing,
}

impl KeyRing {
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, Error> {
        let signature_key = SecretKey::from_slice(secret).map_err(|_| Error::InvalidKey)?;
        let pub_key = PublicKey::from_secret_key(&Secp256k1::signing_only(), &signature_key);
        Ok(Self {
            signature_key,
            pub_key_ring: PubKeyRing::new(pub_key),
        })
    }

    /// Create a key ring from fresh randomness.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            // out of range scalars are astronomically rare, draw again
            if let Ok(key_ring) = Self::from_secret_bytes(&secret) {
                return key_ring;
            }
        }
    }

    pub fn pub_key_ring(&self) -> &PubKeyRing {
        &self.pub_key_ring
    }

    /// DER encoded signature of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let signature = Secp256k1::signing_only().sign_ecdsa(&digest(data)?, &self.signature_key);
        Ok(signature.serialize_der().to_vec())
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("pub_key_ring", &self.pub_key_ring)
            .finish()
    }
}
