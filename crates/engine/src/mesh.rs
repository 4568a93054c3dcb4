//! Shard-to-shard routing
//!
//! A command that lands on the wrong shard is forwarded over a bounded
//! channel dedicated to that (sender, receiver) pair, so every channel has
//! exactly one producer and one consumer. A full channel is backpressure:
//! the command is handed back to the caller instead of blocking the loop.

use quiver_core::{Command, Key, ShardId};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use xxhash_rust::xxh3::xxh3_64;

/// Shard owning `key` among `shards` shards.
pub fn shard_for(key: &Key, shards: usize) -> ShardId {
    if shards <= 1 {
        return 0;
    }
    (xxh3_64(key.as_bytes()) % shards as u64) as ShardId
}

/// Why a forward did not happen.
#[derive(Debug)]
pub enum RouteError {
    /// The peer's queue is full
    Full(Command),
    /// The peer has shut down
    Disconnected(Command),
}

impl RouteError {
    /// Recover the command.
    pub fn into_command(self) -> Command {
        match self {
            RouteError::Full(c) | RouteError::Disconnected(c) => c,
        }
    }
}

/// One shard's endpoints into the mesh.
pub struct ShardLink {
    id: ShardId,
    shards: usize,
    outbound: Vec<Option<SyncSender<Command>>>,
    inbound: Vec<Receiver<Command>>,
    next_inbound: usize,
}

impl std::fmt::Debug for ShardLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardLink")
            .field("id", &self.id)
            .field("shards", &self.shards)
            .finish()
    }
}

/// Constructor for the full mesh.
pub struct ShardMesh;

impl ShardMesh {
    /// Links for `shards` shards, each pair joined by a queue of `capacity`.
    ///
    /// Element `i` of the result belongs to shard `i`.
    pub fn new(shards: usize, capacity: usize) -> Vec<ShardLink> {
        let mut links: Vec<ShardLink> = (0..shards)
            .map(|id| ShardLink {
                id,
                shards,
                outbound: (0..shards).map(|_| None).collect(),
                inbound: Vec::with_capacity(shards.saturating_sub(1)),
                next_inbound: 0,
            })
            .collect();
        for from in 0..shards {
            for to in 0..shards {
                if from == to {
                    continue;
                }
                let (tx, rx) = mpsc::sync_channel(capacity.max(1));
                links[from].outbound[to] = Some(tx);
                links[to].inbound.push(rx);
            }
        }
        links
    }
}

impl ShardLink {
    /// This shard's id.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Number of shards in the mesh.
    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Shard owning `key`.
    pub fn owner_of(&self, key: &Key) -> ShardId {
        shard_for(key, self.shards)
    }

    /// Whether `command` belongs elsewhere; returns the owner if so.
    pub fn foreign_owner(&self, command: &Command) -> Option<ShardId> {
        let owner = self.owner_of(command.routing_key()?);
        (owner != self.id).then_some(owner)
    }

    /// Forward `command` to shard `to` without blocking.
    pub fn route(&self, to: ShardId, command: Command) -> Result<(), RouteError> {
        let Some(Some(tx)) = self.outbound.get(to) else {
            return Err(RouteError::Disconnected(command));
        };
        tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(c) => RouteError::Full(c),
            TrySendError::Disconnected(c) => RouteError::Disconnected(c),
        })
    }

    /// Receive up to `max` forwarded commands, rotating over peers.
    pub fn drain(&mut self, max: usize, out: &mut Vec<Command>) -> usize {
        let peers = self.inbound.len();
        if peers == 0 {
            return 0;
        }
        let mut received = 0;
        let mut idle_peers = 0;
        while received < max && idle_peers < peers {
            let rx = &self.inbound[self.next_inbound];
            self.next_inbound = (self.next_inbound + 1) % peers;
            match rx.try_recv() {
                Ok(cmd) => {
                    out.push(cmd);
                    received += 1;
                    idle_peers = 0;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => idle_peers += 1,
            }
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::VectorRecord;

    fn key_owned_by(owner: ShardId, shards: usize) -> Key {
        (0..)
            .map(|i| Key::from(format!("key-{}", i)))
            .find(|k| shard_for(k, shards) == owner)
            .unwrap()
    }

    #[test]
    fn test_single_shard_owns_everything() {
        assert_eq!(shard_for(&Key::from("anything"), 1), 0);
        assert_eq!(shard_for(&Key::from("anything"), 0), 0);
        let links = ShardMesh::new(1, 4);
        let cmd = Command::get(1, "x");
        assert_eq!(links[0].foreign_owner(&cmd), None);
    }

    #[test]
    fn test_route_and_drain() {
        let mut links = ShardMesh::new(3, 2);
        let key = key_owned_by(2, 3);
        let cmd = Command::upsert(1, key.clone(), VectorRecord::from_vector(vec![1.0]));
        assert_eq!(links[0].foreign_owner(&cmd), Some(2));
        assert_eq!(links[2].foreign_owner(&cmd), None);
        links[0].route(2, cmd.clone()).unwrap();

        let mut got = Vec::new();
        assert_eq!(links[1].drain(10, &mut got), 0);
        assert_eq!(links[2].drain(10, &mut got), 1);
        assert_eq!(got, vec![cmd]);
    }

    #[test]
    fn test_full_queue_returns_command() {
        let links = ShardMesh::new(2, 1);
        links[0].route(1, Command::get(1, "a")).unwrap();
        match links[0].route(1, Command::get(2, "b")) {
            Err(RouteError::Full(c)) => assert_eq!(c.id.0, 2),
            other => panic!("expected full queue, got {:?}", other),
        }
        assert!(matches!(
            links[0].route(0, Command::get(3, "c")),
            Err(RouteError::Disconnected(_))
        ));
    }

    #[test]
    fn test_drain_is_fair_across_peers() {
        let mut links = ShardMesh::new(3, 8);
        for i in 0..4 {
            links[0].route(2, Command::get(i, "a")).unwrap();
            links[1].route(2, Command::get(100 + i, "b")).unwrap();
        }
        let mut got = Vec::new();
        assert_eq!(links[2].drain(4, &mut got), 4);
        let from_zero = got.iter().filter(|c| c.id.0 < 100).count();
        assert_eq!(from_zero, 2);
        got.clear();
        assert_eq!(links[2].drain(100, &mut got), 4);
    }
}
