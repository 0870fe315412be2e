//! End-to-end scenarios
//!
//! Several players, each with their own `GameSession`, play against one
//! `SimulatedChain`: enter, wander for a few epochs, and let their
//! schedulers commit and reveal. Afterwards the invariants are checked:
//! - The chain never rejected a reveal as not matching its commitment
//! - No ledger is left with a commit in flight
//! - Without chaos, every player ends where their last moves led, both on
//!   the chain and in their own view

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use cadence_chain::{unpack_xy, Viewport};
use cadence_core::{
    Address, CadenceResult, ChainTime, EntityId, Epoch, LocalAction, Position, Signer, WallTime,
};
use cadence_runtime::{display_duration, GameSession, RuntimeConfig, SessionDeps};
use cadence_state::MemoryStore;
use cadence_time::TokioWallClock;

use crate::{ChainStats, ChaosConfig, SimChainConfig, SimulatedChain};

/// Delay into an epoch before players act
const PLAY_OFFSET: Duration = Duration::from_secs(2);

const STEPS: [(i64, i64); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub players: usize,
    /// Epochs played after the entry epoch
    pub epochs: u64,
    pub moves_per_epoch: usize,
    /// Wall clock offset of player `i` is `i * clock_skew`
    pub clock_skew: Duration,
    pub chain: SimChainConfig,
    pub seed: u64,
}

impl ScenarioConfig {
    /// One player, two epochs
    pub fn minimal() -> Self {
        ScenarioConfig {
            players: 1,
            epochs: 2,
            moves_per_epoch: 1,
            clock_skew: Duration::ZERO,
            chain: SimChainConfig::default(),
            seed: 7,
        }
    }

    /// A few players with skewed clocks
    pub fn standard() -> Self {
        ScenarioConfig {
            players: 3,
            epochs: 4,
            moves_per_epoch: 3,
            clock_skew: Duration::from_millis(1_750),
            ..Self::minimal()
        }
    }

    /// Many players on a flaky chain
    pub fn stress() -> Self {
        ScenarioConfig {
            players: 8,
            epochs: 6,
            moves_per_epoch: 5,
            ..Self::standard()
        }
        .with_chaos(ChaosConfig::flaky())
    }

    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chain.chaos = chaos;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ScenarioResult {
    pub epochs_run: u64,
    pub players: usize,
    /// Players with an entity on the chain at the end
    pub players_on_chain: usize,
    pub stats: ChainStats,
    /// Chain time covered by the scenario
    pub simulated: Duration,
    pub invariants_maintained: bool,
    pub violations: Vec<String>,
}

impl ScenarioResult {
    pub fn all_on_chain(&self) -> bool {
        self.players_on_chain == self.players
    }
}

struct Player {
    signer: Signer,
    id: EntityId,
    spawn: Position,
    session: GameSession,
    /// Where the moves queued so far should lead
    expected: Option<Position>,
}

pub struct ScenarioHarness {
    config: ScenarioConfig,
    chain: Arc<SimulatedChain>,
    players: Vec<Player>,
    rng: StdRng,
    violations: Vec<String>,
}

impl ScenarioHarness {
    /// Build the chain and one session per player
    ///
    /// Must be called from within a tokio runtime; the chain's clock starts
    /// at its genesis time.
    pub fn new(config: ScenarioConfig) -> CadenceResult<Self> {
        let genesis = config.chain.genesis_time.as_millis();
        let chain = Arc::new(SimulatedChain::new(
            config.chain.clone(),
            Arc::new(TokioWallClock::starting_at(WallTime(genesis))),
        )?);

        let mut players = Vec::with_capacity(config.players);
        for index in 0..config.players {
            let tag = (index + 1) as u8;
            let mut session_key = [tag; 20];
            session_key[0] = 0x5e;
            let signer = Signer {
                owner: Address([tag; 20]),
                address: Address(session_key),
            };
            let skew = config.clock_skew.as_millis() as i64 * index as i64;
            let deps = SessionDeps {
                time_source: chain.clone(),
                entities: chain.clone(),
                fees: chain.clone(),
                transactions: chain.clone(),
                message_signer: chain.clone(),
                store: Arc::new(MemoryStore::new()),
                wall: Arc::new(TokioWallClock::starting_at(WallTime(genesis + skew))),
            };
            let session = GameSession::new(chain.game_config(), RuntimeConfig::default(), deps)?;
            let spawn = Position::new(index as i64 * 4, 0);
            session.set_viewport(Viewport::centered_on(spawn, 128, 128));
            players.push(Player {
                signer,
                id: EntityId::from_owner(&signer.owner, 1),
                spawn,
                session,
                expected: None,
            });
        }

        Ok(ScenarioHarness {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            chain,
            players,
            violations: Vec::new(),
        })
    }

    pub fn chain(&self) -> &Arc<SimulatedChain> {
        &self.chain
    }

    pub fn session(&self, player: usize) -> Option<&GameSession> {
        self.players.get(player).map(|p| &p.session)
    }

    pub async fn run(&mut self) -> ScenarioResult {
        let started = self.chain.now();
        let calculator = self.chain.calculator();
        let first = self.chain.current_epoch();

        for player in &self.players {
            player.session.set_signer(Some(player.signer));
            player.session.start();
        }
        self.sleep_until(calculator.epoch_start(first) + PLAY_OFFSET).await;
        for player in &mut self.players {
            enter(player, &mut self.violations);
        }

        let last = Epoch::new(first.value() + self.config.epochs);
        let mut epoch = first.next();
        while epoch <= last {
            self.sleep_until(calculator.epoch_start(epoch) + PLAY_OFFSET)
                .await;
            self.play_epoch(epoch);
            epoch = epoch.next();
        }
        // Let the last epoch be revealed and polled
        self.sleep_until(calculator.epoch_start(last.next()) + PLAY_OFFSET)
            .await;

        let result = self.finish(started);
        for player in &self.players {
            player.session.stop();
        }
        result
    }

    async fn sleep_until(&self, at: ChainTime) {
        let wait = at.millis_since(self.chain.now());
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }
    }

    fn play_epoch(&mut self, epoch: Epoch) {
        for player in &mut self.players {
            let on_chain = player
                .session
                .onchain_state()
                .with(|state| state.get(&player.id).map(|e| e.position));
            let Some(mut position) = on_chain else {
                let entering = player
                    .session
                    .local_state()
                    .with(|s| s.entity().map_or(false, |e| e.is_entering()));
                if !entering {
                    info!(entity = %player.id, epoch = %epoch, "not on chain, entering again");
                    enter(player, &mut self.violations);
                }
                continue;
            };

            for _ in 0..self.config.moves_per_epoch {
                let (dx, dy) = STEPS[self.rng.gen_range(0..STEPS.len())];
                position = Position::new(position.x + dx, position.y + dy);
                match player.session.play(LocalAction::move_to(position)) {
                    Ok(true) => player.expected = Some(position),
                    Ok(false) => {
                        warn!(entity = %player.id, epoch = %epoch, "time up before moving");
                        break;
                    }
                    Err(err) => {
                        self.violations
                            .push(format!("{} could not move in {epoch}: {err}", player.id));
                        break;
                    }
                }
            }
        }
    }

    fn finish(&mut self, started: ChainTime) -> ScenarioResult {
        let stats = self.chain.stats();
        let calm = self.config.chain.chaos.is_calm();
        let mut violations = std::mem::take(&mut self.violations);

        if stats.rejected_reveals > 0 {
            violations.push(format!(
                "{} reveals did not match their commitment",
                stats.rejected_reveals
            ));
        }

        let mut players_on_chain = 0;
        for player in &self.players {
            if player.session.ledger().is_committing() {
                violations.push(format!("{} still has a commit in flight", player.id));
            }
            let on_chain = self.chain.entity(&player.id);
            if on_chain.is_some() {
                players_on_chain += 1;
            }
            if !calm {
                continue;
            }

            let actual = on_chain.map(|e| unpack_xy(e.position));
            if actual != player.expected {
                violations.push(format!(
                    "{} is at {actual:?} on chain, expected {:?}",
                    player.id, player.expected
                ));
            }
            let viewed = player.session.view_state().with(|view| {
                view.player_entity().map(|e| e.snapshot.position)
            });
            if viewed != player.expected {
                violations.push(format!(
                    "{} is shown at {viewed:?}, expected {:?}",
                    player.id, player.expected
                ));
            }
        }
        if calm && stats.reverted > 0 {
            violations.push(format!("{} transactions reverted without chaos", stats.reverted));
        }

        let simulated = Duration::from_millis(self.chain.now().millis_since(started).max(0) as u64);
        info!(
            players = self.players.len(),
            on_chain = players_on_chain,
            commits = stats.commits,
            reveals = stats.reveals,
            reverted = stats.reverted,
            simulated = %display_duration(simulated),
            violations = violations.len(),
            "scenario finished"
        );

        ScenarioResult {
            epochs_run: self.config.epochs,
            players: self.players.len(),
            players_on_chain,
            stats,
            simulated,
            invariants_maintained: violations.is_empty(),
            violations,
        }
    }
}

fn enter(player: &mut Player, violations: &mut Vec<String>) {
    match player.session.enter(player.id, player.spawn) {
        Ok(_) => player.expected = Some(player.spawn),
        Err(err) => violations.push(format!("{} could not enter: {err}", player.id)),
    }
}

/// Build and run a scenario
pub async fn run_scenario(config: ScenarioConfig) -> CadenceResult<ScenarioResult> {
    let mut harness = ScenarioHarness::new(config)?;
    Ok(harness.run().await)
}
