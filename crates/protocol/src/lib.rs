use libp2p_identity::PublicKey;

mod codes;
pub mod frame;
mod messages;

pub use codes::{ResultCode, UnknownResultCode};
pub use frame::{decode_body, encode_frame, frame_body_len, Envelope, FrameError, MAX_FRAME_LEN};
pub use messages::*;

impl NodeReceipt {
    pub fn store_payload(slice_hash: &str, len: u64, timestamp_ms: u64) -> Vec<u8> {
        format!("store:{slice_hash}:{len}:{timestamp_ms}").into_bytes()
    }

    pub fn verify_store(&self, slice_hash: &str, len: u64) -> bool {
        verify_signature(
            &self.public_key,
            &self.signature,
            &Self::store_payload(slice_hash, len, self.timestamp_ms),
        )
    }

    pub fn is_fresh(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) <= max_age_ms
    }

    /// P2P address of the signer, if the embedded key decodes.
    pub fn signer(&self) -> Option<String> {
        PublicKey::try_decode_protobuf(&self.public_key)
            .ok()
            .map(|key| key.to_peer_id().to_string())
    }
}

fn verify_signature(public_key: &[u8], signature: &[u8], payload: &[u8]) -> bool {
    let Ok(public_key) = PublicKey::try_decode_protobuf(public_key) else {
        return false;
    };
    public_key.verify(payload, signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p_identity::Keypair;

    fn signed_receipt(keypair: &Keypair, slice_hash: &str, len: u64, ts: u64) -> NodeReceipt {
        let payload = NodeReceipt::store_payload(slice_hash, len, ts);
        NodeReceipt {
            timestamp_ms: ts,
            signature: keypair.sign(&payload).unwrap(),
            public_key: keypair.public().encode_protobuf(),
        }
    }

    #[test]
    fn receipt_verifies_for_matching_slice() {
        let keypair = Keypair::generate_ed25519();
        let receipt = signed_receipt(&keypair, "slice-a", 1000, 5);
        assert!(receipt.verify_store("slice-a", 1000));
        assert_eq!(
            receipt.signer(),
            Some(keypair.public().to_peer_id().to_string())
        );
    }

    #[test]
    fn receipt_rejects_other_slice_or_length() {
        let keypair = Keypair::generate_ed25519();
        let receipt = signed_receipt(&keypair, "slice-a", 1000, 5);
        assert!(!receipt.verify_store("slice-b", 1000));
        assert!(!receipt.verify_store("slice-a", 999));
    }

    #[test]
    fn empty_receipt_never_verifies() {
        assert!(!NodeReceipt::default().verify_store("slice-a", 0));
        assert_eq!(NodeReceipt::default().signer(), None);
    }

    #[test]
    fn freshness_window() {
        let receipt = NodeReceipt {
            timestamp_ms: 1_000,
            ..Default::default()
        };
        assert!(receipt.is_fresh(1_500, 500));
        assert!(!receipt.is_fresh(1_501, 500));
    }
}
