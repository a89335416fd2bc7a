use anyhow::Context;
use libp2p_identity::Keypair;
use sds_protocol::PpInfo;
use std::fs;
use std::path::Path;

use crate::error::{NodeError, Result};

pub const IDENTITY_FILE: &str = "node_identity.key";

/// Loads the node key from `storage_path`, creating one on first start.
pub fn load_or_create_keypair(storage_path: &Path) -> anyhow::Result<Keypair> {
    let key_path = storage_path.join(IDENTITY_FILE);
    if key_path.exists() {
        let bytes = fs::read(&key_path)
            .with_context(|| format!("failed to read node key {}", key_path.display()))?;
        return Keypair::from_protobuf_encoding(&bytes)
            .with_context(|| format!("failed to decode node key {}", key_path.display()));
    }
    fs::create_dir_all(storage_path)?;
    let keypair = Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding()?;
    fs::write(&key_path, encoded)
        .with_context(|| format!("failed to write node key {}", key_path.display()))?;
    Ok(keypair)
}

/// Who this node is on the network and where its rewards go.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    pub p2p_address: String,
    pub wallet_address: String,
    pub beneficiary_address: String,
    pub network_address: String,
}

impl NodeIdentity {
    pub fn new(keypair: Keypair, wallet_address: &str, beneficiary_address: &str, network_address: &str) -> Self {
        let beneficiary = if beneficiary_address.is_empty() {
            wallet_address
        } else {
            beneficiary_address
        };
        Self {
            p2p_address: keypair.public().to_peer_id().to_string(),
            keypair,
            wallet_address: wallet_address.to_string(),
            beneficiary_address: beneficiary.to_string(),
            network_address: network_address.to_string(),
        }
    }

    pub fn pp_info(&self) -> PpInfo {
        PpInfo {
            p2p_address: self.p2p_address.clone(),
            wallet_address: self.wallet_address.clone(),
            network_address: self.network_address.clone(),
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.keypair.public().encode_protobuf()
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.keypair
            .sign(payload)
            .map_err(|err| NodeError::SignatureFailure(err.to_string()))
    }

    pub fn is_local(&self, p2p_address: &str) -> bool {
        p2p_address == self.p2p_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_survives_restart() {
        let dir = std::env::temp_dir().join(format!("sds-identity-{}", rand::random::<u64>()));
        let first = load_or_create_keypair(&dir).unwrap();
        let second = load_or_create_keypair(&dir).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn beneficiary_defaults_to_wallet() {
        let identity = NodeIdentity::new(Keypair::generate_ed25519(), "st1wallet", "", "127.0.0.1:1");
        assert_eq!(identity.beneficiary_address, "st1wallet");
        assert!(identity.is_local(&identity.pp_info().p2p_address));
        assert!(!identity.sign(b"payload").unwrap().is_empty());
    }
}
