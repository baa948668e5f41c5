use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use narrowband::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// A tiny word game kept in memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Play {
    word: String,
    score: u32,
}

struct Game {
    game_id: GameId,
    deleted: bool,
    plays: Vec<Play>,
}

/// One device's game storage.
struct Shelf {
    owner: &'static str,
    games: Mutex<HashMap<RowId, Game>>,
    next_row: Mutex<i64>,
}

impl Shelf {
    fn new(owner: &'static str) -> Arc<Self> {
        Arc::new(Self {
            owner,
            games: Mutex::new(HashMap::new()),
            next_row: Mutex::new(1),
        })
    }

    fn create(&self, game_id: GameId) -> RowId {
        let mut next = self.next_row.lock();
        let row = RowId(*next);
        *next += 1;
        self.games.lock().insert(
            row,
            Game {
                game_id,
                deleted: false,
                plays: Vec::new(),
            },
        );
        row
    }

    fn delete(&self, row: RowId) {
        if let Some(game) = self.games.lock().get_mut(&row) {
            game.deleted = true;
        }
    }

    fn total(&self, row: RowId) -> u32 {
        self.games
            .lock()
            .get(&row)
            .map(|g| g.plays.iter().map(|p| p.score).sum())
            .unwrap_or(0)
    }
}

impl GameEngine for Shelf {
    fn apply_inbound(&self, row: RowId, bytes: &[u8], from: &PeerAddress) -> ApplyOutcome {
        let mut games = self.games.lock();
        let Some(game) = games.get_mut(&row).filter(|g| !g.deleted) else {
            return ApplyOutcome::GameGone;
        };
        match serde_json::from_slice::<Play>(bytes) {
            Ok(play) => {
                tracing::info!(shelf = self.owner, %from, word = %play.word, score = play.score, "play received");
                game.plays.push(play);
                ApplyOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(shelf = self.owner, error = %e, "unreadable play");
                ApplyOutcome::Delivered
            }
        }
    }
}

impl GameResolver for Shelf {
    fn row_for_game(&self, game_id: GameId) -> Option<RowId> {
        self.games
            .lock()
            .iter()
            .find(|(_, g)| g.game_id == game_id)
            .map(|(row, _)| *row)
    }

    fn create_from_invite(
        &self,
        invite: &InviteInfo,
        from: &PeerAddress,
        channel: ChannelType,
    ) -> Option<RowId> {
        tracing::info!(shelf = self.owner, %from, %channel, inviter = %invite.name, "accepting invite");
        Some(self.create(invite.game_id))
    }

    fn mark_remote_gone(&self, row: RowId, from: &PeerAddress) {
        tracing::info!(shelf = self.owner, %row, %from, "opponent left");
    }

    fn confirm_invite(&self, row: RowId, from: &PeerAddress) {
        tracing::info!(shelf = self.owner, %row, %from, "invite confirmed");
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

struct Device {
    shelf: Arc<Shelf>,
    endpoint: Endpoint<MemoryChannel>,
}

fn device(net: &MemoryNetwork, name: &'static str) -> Result<Device, NarrowbandError> {
    let shelf = Shelf::new(name);
    let config = NodeConfig {
        batch: BatchConfig {
            max_wait: Duration::from_millis(200),
            ..BatchConfig::default()
        },
        ..NodeConfig::default()
    };
    let node = Node::builder()
        .config(config)
        .engine(shelf.clone())
        .resolver(shelf.clone())
        .notifications(move |n: Notification| tracing::info!(device = name, "{n}"))
        .build()?;
    let (channel, inbound) = net.join(name);
    let endpoint = node.endpoint(channel);
    let runner = endpoint.clone();
    tokio::spawn(async move { runner.run(inbound).await });
    Ok(Device { shelf, endpoint })
}

fn play(game_id: GameId, word: &str, score: u32) -> Result<Command, NarrowbandError> {
    let payload = JsonCodec.encode(&Play {
        word: word.into(),
        score,
    })?;
    Ok(Command::Data { game_id, payload })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::main]
async fn main() -> Result<(), NarrowbandError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let net = MemoryNetwork::datagram();
    let alice = device(&net, "alice")?;
    let bob = device(&net, "bob")?;
    let alice_addr = PeerAddress::new("alice");
    let bob_addr = PeerAddress::new("bob");

    let game_id = GameId(0x5EED_0001);
    let alice_row = alice.shelf.create(game_id);
    let invite = Command::Invite(InviteInfo {
        game_id,
        name: "Alice".into(),
        lang: "en".into(),
        players_total: 2,
        players_here: 1,
        dict_name: Some("CollegeEng_2to8".into()),
        channels: vec![ChannelType::Sms],
    });
    alice.endpoint.send_now(&bob_addr, &invite).await?;
    settle().await;

    for (word, score) in [("QUIXOTIC", 94), ("ZEBRA", 33)] {
        alice.endpoint.send(&bob_addr, &play(game_id, word, score)?).await?;
    }
    settle().await;
    bob.endpoint.send(&alice_addr, &play(game_id, "JINX", 26)?).await?;
    settle().await;

    let bob_row = bob.shelf.row_for_game(game_id).unwrap_or(RowId(0));
    tracing::info!(points = bob.shelf.total(bob_row), "alice's plays on bob's copy");
    tracing::info!(points = alice.shelf.total(alice_row), "bob's plays on alice's copy");

    // Deleted games keep their row, so Alice's next play comes back as
    // GameGone and earns her a death notice.
    bob.shelf.delete(bob_row);
    alice.endpoint.send(&bob_addr, &play(game_id, "LATE", 4)?).await?;
    settle().await;
    settle().await;

    println!("--- alice ---\n{}", alice.endpoint.node().status_text(&[ChannelType::Sms]));
    println!("--- bob ---\n{}", bob.endpoint.node().status_text(&[ChannelType::Sms]));
    Ok(())
}
