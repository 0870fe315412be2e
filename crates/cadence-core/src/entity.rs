//! On-chain entities and the authoritative state snapshot

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Address, EntityId, Epoch, LocalAction, Position};

/// Kind of player-controlled entity
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    #[default]
    Avatar,
    Empire,
}

/// Entity as last read from the game contract
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub owner: Address,
    pub kind: EntityKind,
    pub position: Position,
    /// Remaining life (avatars) or strength (empires); zero once defeated
    pub life: u64,
    /// Last epoch the contract updated this entity in
    pub last_epoch: Epoch,
    /// Actions revealed for the previous epoch, oldest first
    pub actions: Vec<LocalAction>,
}

/// Authoritative snapshot from one consistent remote read
///
/// Replaced wholesale on every successful poll, never merged.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct OnchainState {
    pub entities: BTreeMap<EntityId, EntitySnapshot>,
    pub epoch: Epoch,
}

impl OnchainState {
    pub fn get(&self, id: &EntityId) -> Option<&EntitySnapshot> {
        self.entities.get(id)
    }

    pub fn insert(&mut self, entity: EntitySnapshot) {
        self.entities.insert(entity.id, entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Identity of the signed-in player
///
/// `owner` is the wallet that owns the entity, `address` the session key
/// that signs game transactions on its behalf.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Signer {
    pub owner: Address,
    pub address: Address,
}
