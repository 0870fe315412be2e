//! Commitments: what gets hashed at commit time and proven at reveal time
//!
//! Actions travel to the contract as `(uint8 actionType, uint128 data)`
//! tuples. The commitment is
//! `keccak256(abi.encode(bytes32 secret, (uint8,uint128)[] actions))`
//! truncated to 24 bytes. The secret is the keccak256 of the player's
//! signature over `Commit:{chainId}:{game}:{epoch}`, so it can be derived
//! again after a reload without storing key material.

use std::fmt;

use sha3::{Digest, Keccak256};

use cadence_core::{
    Address, CadenceError, CadenceResult, ChainId, Epoch, LocalAction, Position, Secret,
};

use crate::{pack_position, unpack_xy, MessageSigner};

pub const COMMITMENT_LEN: usize = 24;

/// Avatar game action codes
pub mod avatar_codes {
    pub const ENTER: u8 = 0;
    pub const MOVE: u8 = 1;
    pub const EXIT: u8 = 2;
}

/// Empire game action codes
pub mod empire_codes {
    pub const ACQUIRE: u8 = 0;
    pub const SEND_FLEET: u8 = 1;
}

/// Action as the contract stores it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContractAction {
    pub action_type: u8,
    pub data: u128,
}

/// Truncated keccak256 commitment
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitmentHash(pub [u8; COMMITMENT_LEN]);

impl CommitmentHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitmentHash({})", self.to_hex())
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

pub fn encode_action(action: &LocalAction) -> ContractAction {
    let (action_type, target) = match *action {
        LocalAction::Enter { x, y } => (avatar_codes::ENTER, Position::new(x, y)),
        LocalAction::Move { x, y } => (avatar_codes::MOVE, Position::new(x, y)),
        LocalAction::Exit { x, y } => (avatar_codes::EXIT, Position::new(x, y)),
        LocalAction::Acquire { location } => (empire_codes::ACQUIRE, location),
        LocalAction::SendFleet { to, .. } => (empire_codes::SEND_FLEET, to),
    };
    ContractAction {
        action_type,
        data: pack_position(target),
    }
}

/// Decode a revealed avatar action
pub fn decode_avatar_action(action: &ContractAction) -> CadenceResult<LocalAction> {
    let target = unpack_xy(action.data);
    match action.action_type {
        avatar_codes::ENTER => Ok(LocalAction::enter(target)),
        avatar_codes::MOVE => Ok(LocalAction::move_to(target)),
        avatar_codes::EXIT => Ok(LocalAction::exit(target)),
        other => Err(CadenceError::Serialization(format!(
            "unknown avatar action type {other}"
        ))),
    }
}

/// ABI encoding of `(bytes32 secret, (uint8,uint128)[] actions)`
pub fn abi_encode_commitment(secret: &Secret, actions: &[LocalAction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 * (3 + 2 * actions.len()));
    out.extend_from_slice(secret.as_bytes());
    // Offset of the dynamic array: right after the two head words
    out.extend_from_slice(&word(0x40));
    out.extend_from_slice(&word(actions.len() as u128));
    for action in actions {
        let encoded = encode_action(action);
        out.extend_from_slice(&word(encoded.action_type as u128));
        out.extend_from_slice(&word(encoded.data));
    }
    out
}

fn word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn commitment_hash(secret: &Secret, actions: &[LocalAction]) -> CommitmentHash {
    let digest = keccak256(&abi_encode_commitment(secret, actions));
    let mut truncated = [0u8; COMMITMENT_LEN];
    truncated.copy_from_slice(&digest[..COMMITMENT_LEN]);
    CommitmentHash(truncated)
}

/// Message signed to derive the commit secret of an epoch
pub fn commit_message(chain_id: ChainId, game: &Address, epoch: Epoch) -> String {
    format!("Commit:{chain_id}:{game}:{epoch}")
}

/// Derive the commit secret for `epoch` from the signer's signature
pub async fn derive_secret(
    signer: &dyn MessageSigner,
    signer_address: &Address,
    chain_id: ChainId,
    game: &Address,
    epoch: Epoch,
) -> CadenceResult<Secret> {
    let message = commit_message(chain_id, game, epoch);
    let signature = signer.sign_message(signer_address, &message).await?;
    if signature.is_empty() {
        return Err(CadenceError::Signing("empty signature".into()));
    }
    Ok(Secret::from_bytes(keccak256(&signature)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn test_keccak_empty_input() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_action_codes() {
        let enter = encode_action(&LocalAction::enter(Position::new(2, 3)));
        assert_eq!(enter.action_type, 0);
        assert_eq!(unpack_xy(enter.data), Position::new(2, 3));
        assert_eq!(encode_action(&LocalAction::move_to(Position::default())).action_type, 1);
        assert_eq!(encode_action(&LocalAction::exit(Position::default())).action_type, 2);

        let fleet = encode_action(&LocalAction::SendFleet {
            from: Position::new(0, 0),
            to: Position::new(-4, 9),
            spaceships: 10,
        });
        assert_eq!(fleet.action_type, empire_codes::SEND_FLEET);
        assert_eq!(unpack_xy(fleet.data), Position::new(-4, 9));
    }

    #[test]
    fn test_decode_avatar_action() {
        let action = LocalAction::move_to(Position::new(-7, 1));
        assert_eq!(decode_avatar_action(&encode_action(&action)).unwrap(), action);
        let unknown = ContractAction {
            action_type: 9,
            data: 0,
        };
        assert!(matches!(
            decode_avatar_action(&unknown),
            Err(CadenceError::Serialization(_))
        ));
    }

    #[test]
    fn test_abi_layout() {
        let secret = Secret::from_bytes([0xab; 32]);
        let actions = [
            LocalAction::move_to(Position::new(1, 0)),
            LocalAction::exit(Position::new(1, 0)),
        ];
        let encoded = abi_encode_commitment(&secret, &actions);
        assert_eq!(encoded.len(), 32 * 7);
        assert_eq!(&encoded[..32], &[0xab; 32]);
        assert_eq!(encoded[63], 0x40);
        assert_eq!(encoded[95], 2);
        assert_eq!(encoded[127], avatar_codes::MOVE);
        assert_eq!(encoded[159], 1);
        assert_eq!(encoded[191], avatar_codes::EXIT);
    }

    #[test]
    fn test_commitment_depends_on_secret_and_actions() {
        let actions = [LocalAction::move_to(Position::new(1, 1))];
        let a = commitment_hash(&Secret::from_bytes([1; 32]), &actions);
        let b = commitment_hash(&Secret::from_bytes([2; 32]), &actions);
        let c = commitment_hash(&Secret::from_bytes([1; 32]), &[]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, commitment_hash(&Secret::from_bytes([1; 32]), &actions));
        assert_eq!(a.to_hex().len(), 2 + 48);
    }

    #[test]
    fn test_commit_message_format() {
        let game: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        assert_eq!(
            commit_message(ChainId(31337), &game, Epoch(5)),
            "Commit:31337:0x00000000000000000000000000000000000000aa:5"
        );
    }

    struct EchoSigner;

    #[async_trait]
    impl MessageSigner for EchoSigner {
        async fn sign_message(&self, _signer: &Address, message: &str) -> CadenceResult<Vec<u8>> {
            Ok(message.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn test_secret_is_per_epoch() {
        let game = Address::from_bytes([3; 20]);
        let me = Address::from_bytes([4; 20]);
        let s5 = derive_secret(&EchoSigner, &me, ChainId(1), &game, Epoch(5)).await.unwrap();
        let s5_again = derive_secret(&EchoSigner, &me, ChainId(1), &game, Epoch(5)).await.unwrap();
        let s6 = derive_secret(&EchoSigner, &me, ChainId(1), &game, Epoch(6)).await.unwrap();
        assert_eq!(s5, s5_again);
        assert_ne!(s5, s6);
    }
}
