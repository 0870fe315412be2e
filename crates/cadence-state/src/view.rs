//! View Reconciler
//!
//! Merges the authoritative on-chain snapshot with the player's pending
//! actions into one renderable `ViewState`. Recomputed on every change of
//! either source; the sources are never written.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use cadence_core::{
    EntityId, EntityKind, EntitySnapshot, Epoch, Observable, OnchainState, Position, Subscription,
};
use cadence_time::{EpochCalculator, SyncedClock};

use crate::LocalState;

/// Entity as rendered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewEntity {
    /// On-chain data; `position` is where the entity ends up after its
    /// queued actions
    pub snapshot: EntitySnapshot,
    /// Path to animate along, starting at the on-chain position
    pub trajectory: Vec<Position>,
}

impl ViewEntity {
    fn at_rest(snapshot: EntitySnapshot) -> Self {
        let trajectory = vec![snapshot.position];
        ViewEntity {
            snapshot,
            trajectory,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewState {
    /// The player's own entity, when it is shown
    pub player: Option<EntityId>,
    pub entities: BTreeMap<EntityId, ViewEntity>,
    /// Epoch of the on-chain snapshot
    pub epoch: Epoch,
}

impl ViewState {
    pub fn player_entity(&self) -> Option<&ViewEntity> {
        self.player.and_then(|id| self.entities.get(&id))
    }
}

/// Build the view for `current_epoch`
pub fn reconcile(onchain: &OnchainState, local: &LocalState, current_epoch: Epoch) -> ViewState {
    let mut entities: BTreeMap<EntityId, ViewEntity> = onchain
        .entities
        .iter()
        .map(|(id, snapshot)| (*id, ViewEntity::at_rest(snapshot.clone())))
        .collect();
    let mut player = None;

    if let (Some(signer), Some(pending)) = (local.signer(), local.entity()) {
        let on_chain = onchain.get(&pending.id).cloned();
        // An entity that committed its exit disappears once the chain drops it
        if on_chain.is_some() || !pending.exiting {
            player = Some(pending.id);

            let base = if pending.is_entering() {
                // Not on-chain yet: stand in at the entry point
                pending.actions.first().map(|enter| EntitySnapshot {
                    id: pending.id,
                    owner: signer.owner,
                    kind: EntityKind::Avatar,
                    position: enter.target(),
                    life: 1,
                    last_epoch: current_epoch,
                    actions: Vec::new(),
                })
            } else {
                on_chain
            };

            if let Some(mut snapshot) = base {
                let mut trajectory = vec![snapshot.position];
                if pending.epoch == current_epoch {
                    // The placeholder already stands on the enter target
                    let skip = usize::from(pending.is_entering());
                    trajectory.extend(pending.actions.iter().skip(skip).map(|a| a.target()));
                }
                if let Some(last) = trajectory.last() {
                    snapshot.position = *last;
                }
                snapshot.actions = pending.actions.clone();
                entities.insert(
                    pending.id,
                    ViewEntity {
                        snapshot,
                        trajectory,
                    },
                );
            }
        }
    }

    // Defeated entities linger on-chain; hide them once they are stale.
    // Display heuristic only.
    entities.retain(|id, entity| {
        Some(*id) == player
            || entity.snapshot.life > 0
            || entity.snapshot.last_epoch.next() >= current_epoch
    });

    ViewState {
        player,
        entities,
        epoch: onchain.epoch,
    }
}

/// Keeps a `ViewState` stream up to date with its two sources
pub struct ViewReconciler {
    view: Observable<ViewState>,
    onchain: Observable<OnchainState>,
    local: Observable<LocalState>,
    clock: Arc<SyncedClock>,
    calculator: EpochCalculator,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ViewReconciler {
    pub fn new(
        onchain: Observable<OnchainState>,
        local: Observable<LocalState>,
        clock: Arc<SyncedClock>,
        calculator: EpochCalculator,
    ) -> Self {
        ViewReconciler {
            view: Observable::new(ViewState::default()),
            onchain,
            local,
            clock,
            calculator,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn view(&self) -> Observable<ViewState> {
        self.view.clone()
    }

    /// Subscribe to both sources; no-op if already started
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        let weak = Arc::downgrade(self);
        subscriptions.push(self.onchain.subscribe(Self::on_change(weak.clone())));
        subscriptions.push(self.local.subscribe(Self::on_change(weak)));
    }

    pub fn stop(&self) {
        self.subscriptions.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    /// Recompute the view from the current sources
    pub fn recompute(&self) {
        let epoch = self.calculator.epoch_number(self.clock.now());
        let view = self
            .onchain
            .with(|onchain| self.local.with(|local| reconcile(onchain, local, epoch)));
        trace!(entities = view.entities.len(), epoch = %epoch, "view recomputed");
        self.view.set(view);
    }

    fn on_change<T: 'static>(weak: Weak<Self>) -> impl Fn(&T) + Send + Sync + 'static {
        move |_| {
            if let Some(this) = weak.upgrade() {
                this.recompute();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PendingEntity, SignedInState};
    use cadence_core::{Address, LocalAction, ManualWallClock, Signer, WallTime};
    use std::time::Duration;

    const PLAYER: Signer = Signer {
        owner: Address([0x11; 20]),
        address: Address([0x22; 20]),
    };

    fn snapshot(id: u128, position: Position, life: u64, last_epoch: u64) -> EntitySnapshot {
        EntitySnapshot {
            id: EntityId::from_u128(id),
            owner: Address([id as u8; 20]),
            kind: EntityKind::Avatar,
            position,
            life,
            last_epoch: Epoch(last_epoch),
            actions: vec![],
        }
    }

    fn onchain(entities: Vec<EntitySnapshot>, epoch: u64) -> OnchainState {
        let mut state = OnchainState {
            entities: BTreeMap::new(),
            epoch: Epoch(epoch),
        };
        for entity in entities {
            state.insert(entity);
        }
        state
    }

    fn local(entity: PendingEntity) -> LocalState {
        LocalState::SignedIn(SignedInState {
            signer: PLAYER,
            entity: Some(entity),
            tutorial_seen: true,
        })
    }

    #[test]
    fn test_entering_entity_gets_placeholder() {
        let id = EntityId::from_u128(9);
        let pending = PendingEntity::entering(id, Epoch(4), Position::new(3, -2));
        let view = reconcile(&onchain(vec![], 4), &local(pending), Epoch(4));

        assert_eq!(view.player, Some(id));
        let entity = view.player_entity().unwrap();
        assert_eq!(entity.snapshot.owner, PLAYER.owner);
        assert_eq!(entity.snapshot.position, Position::new(3, -2));
        assert_eq!(entity.snapshot.life, 1);
        assert_eq!(entity.trajectory, vec![Position::new(3, -2)]);
    }

    #[test]
    fn test_trajectory_follows_queued_actions() {
        let id = EntityId::from_u128(1);
        let pending = PendingEntity {
            id,
            actions: vec![
                LocalAction::move_to(Position::new(1, 0)),
                LocalAction::move_to(Position::new(1, 1)),
            ],
            epoch: Epoch(6),
            submission: None,
            exiting: false,
        };
        let chain = onchain(vec![snapshot(1, Position::new(0, 0), 3, 5)], 6);

        let view = reconcile(&chain, &local(pending.clone()), Epoch(6));
        let entity = view.player_entity().unwrap();
        assert_eq!(
            entity.trajectory,
            vec![Position::new(0, 0), Position::new(1, 0), Position::new(1, 1)]
        );
        assert_eq!(entity.snapshot.position, Position::new(1, 1));

        // Actions recorded for another epoch are not shown
        let view = reconcile(&chain, &local(pending), Epoch(7));
        assert_eq!(view.player_entity().unwrap().trajectory, vec![Position::new(0, 0)]);
    }

    #[test]
    fn test_exited_entity_hidden_once_gone() {
        let pending = PendingEntity {
            id: EntityId::from_u128(1),
            actions: vec![],
            epoch: Epoch(6),
            submission: None,
            exiting: true,
        };
        let view = reconcile(&onchain(vec![], 6), &local(pending), Epoch(6));
        assert_eq!(view.player, None);
        assert!(view.entities.is_empty());
    }

    #[test]
    fn test_stale_dead_entities_pruned() {
        let chain = onchain(
            vec![
                snapshot(1, Position::new(0, 0), 0, 3),
                snapshot(2, Position::new(1, 0), 0, 4),
                snapshot(3, Position::new(2, 0), 2, 1),
            ],
            5,
        );
        let view = reconcile(&chain, &LocalState::SignedOut, Epoch(5));
        let ids: Vec<_> = view.entities.keys().copied().collect();
        assert_eq!(ids, vec![EntityId::from_u128(2), EntityId::from_u128(3)]);
        assert_eq!(view.epoch, Epoch(5));
    }

    #[test]
    fn test_reconciler_tracks_both_sources() {
        let wall = Arc::new(ManualWallClock::new(WallTime(0)));
        let clock = Arc::new(SyncedClock::new(wall));
        let calculator =
            EpochCalculator::new(Duration::from_secs(20), Duration::from_secs(3), cadence_core::ChainTime::ZERO)
                .unwrap();
        let onchain_store = Observable::new(OnchainState::default());
        let local_store = Observable::new(LocalState::SignedOut);
        let reconciler = Arc::new(ViewReconciler::new(
            onchain_store.clone(),
            local_store.clone(),
            clock,
            calculator,
        ));
        reconciler.start();

        onchain_store.set(onchain(vec![snapshot(4, Position::new(5, 5), 1, 2)], 2));
        assert_eq!(reconciler.view().get().entities.len(), 1);

        local_store.set(local(PendingEntity::entering(
            EntityId::from_u128(8),
            Epoch(2),
            Position::new(0, 0),
        )));
        let view = reconciler.view().get();
        assert_eq!(view.player, Some(EntityId::from_u128(8)));
        assert_eq!(view.entities.len(), 2);

        reconciler.stop();
        onchain_store.set(OnchainState::default());
        assert_eq!(reconciler.view().get().entities.len(), 2);
    }
}
