/*! Circuit construction and the client's table of circuits.

A circuit is an ordered path of relay nodes: a guard, zero or more middles and
an exit. The client keeps every circuit it built until it is destroyed, and
wraps requests for a circuit with `Circuit::seal_request`.
*/

mod errors;
mod selection;

pub use self::errors::*;
pub use self::selection::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rand::thread_rng;
use tokio::sync::RwLock;

use onion_binary_io::*;
use onion_crypto::onion::*;
use onion_packet::*;

use crate::directory::NodeDirectory;
use crate::time::*;

/// Number of hops in a circuit by default: guard, middle and exit.
pub const DEFAULT_PATH_LENGTH: usize = 3;

/** Ordered path of relay nodes.

`nodes[0]` is the guard the client connects to, the last node is the exit.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Circuit {
    /// Identifier of the circuit in the client's table.
    pub id: CircuitId,
    /// Hops of the circuit, guard first.
    pub nodes: Vec<NodeDescriptor>,
    /// When the circuit was built.
    pub created: Instant,
}

impl Circuit {
    /// First hop of the circuit.
    pub fn guard(&self) -> Option<&NodeDescriptor> {
        self.nodes.first()
    }

    /// Last hop of the circuit.
    pub fn exit(&self) -> Option<&NodeDescriptor> {
        self.nodes.last()
    }

    /** Wrap `request` in one layer per hop of the circuit.

    The exit layer carries the request itself, every other layer carries the
    address of the next hop and the onion for it. Layers are built from the
    exit backward. Returns the onion for the guard and the key of the exit
    layer, the exit seals its response with that key.
    */
    pub fn seal_request(&self, request: &ExitRequest) -> Result<(OnionPacket, LayerKey), SealRequestError> {
        let mut rng = thread_rng();

        let exit = self.exit().ok_or(SealRequestError::Encrypt(EncryptOnionError::EmptyHopList))?;
        let instruction = RelayInstruction::Exit(request.clone());
        let payload = to_vec(&instruction, instruction.size())
            .map_err(|error| SealRequestError::Serialize { error })?;
        let (mut onion, exit_key) = encrypt_layer(&mut rng, &payload, &exit.public_key)
            .map_err(SealRequestError::Encrypt)?;

        for pair in self.nodes.windows(2).rev() {
            let (hop, next) = (&pair[0], &pair[1]);
            let instruction = RelayInstruction::Forward(ForwardInstruction {
                next_hop: next.id,
                address: next.address,
                onion,
            });
            let payload = to_vec(&instruction, instruction.size())
                .map_err(|error| SealRequestError::Serialize { error })?;
            let (layer, _key) = encrypt_layer(&mut rng, &payload, &hop.public_key)
                .map_err(SealRequestError::Encrypt)?;
            onion = layer;
        }

        Ok((OnionPacket::from_bytes(onion), exit_key))
    }
}

/// Roles of the hops of a circuit with `len` hops.
fn path_roles(len: usize) -> Vec<Role> {
    match len {
        0 | 1 => vec![Role::Exit],
        len => {
            let mut roles = Vec::with_capacity(len);
            roles.push(Role::Guard);
            roles.extend(std::iter::repeat(Role::Middle).take(len - 2));
            roles.push(Role::Exit);
            roles
        },
    }
}

/** Builds circuits out of directory nodes and keeps them until destroyed.

Cloned builders share the table of circuits.
*/
#[derive(Clone)]
pub struct CircuitBuilder {
    directory: Arc<dyn NodeDirectory>,
    strategy: Arc<dyn SelectionStrategy>,
    path_length: usize,
    circuits: Arc<RwLock<HashMap<CircuitId, Circuit>>>,
}

impl CircuitBuilder {
    /// Create a builder of 3-hop circuits with weighted random selection.
    pub fn new(directory: Arc<dyn NodeDirectory>) -> CircuitBuilder {
        CircuitBuilder {
            directory,
            strategy: Arc::new(WeightedRandom),
            path_length: DEFAULT_PATH_LENGTH,
            circuits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of hops of new circuits. `0` is treated as `1`.
    pub fn with_path_length(mut self, path_length: usize) -> CircuitBuilder {
        self.path_length = path_length.max(1);
        self
    }

    /// Strategy choosing a node among the candidates of a position.
    pub fn with_strategy<S: SelectionStrategy + 'static>(mut self, strategy: S) -> CircuitBuilder {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Number of hops of new circuits.
    pub fn path_length(&self) -> usize {
        self.path_length
    }

    /** Build a new circuit and store it in the table.

    Fresh candidates are fetched from the directory once per role. A node is
    never used twice in the same circuit, and nodes with zero weight are
    never used. Nothing is stored when the circuit can't be built.
    */
    pub async fn create_circuit(&self) -> Result<Circuit, CreateCircuitError> {
        let roles = path_roles(self.path_length);

        let mut candidates: HashMap<Role, Vec<NodeDescriptor>> = HashMap::new();
        for &role in &roles {
            if candidates.contains_key(&role) {
                continue
            }
            let nodes = self.directory.list(Some(role)).await
                .map_err(CreateCircuitError::DirectoryUnavailable)?;
            candidates.insert(role, nodes);
        }

        let mut used = HashSet::new();
        let mut nodes = Vec::with_capacity(roles.len());
        for role in roles {
            let pool = candidates.get(&role)
                .map(|nodes| nodes.iter()
                    .filter(|node| node.role == role && node.weight > 0 && !used.contains(&node.id))
                    .cloned()
                    .collect::<Vec<_>>()
                )
                .unwrap_or_default();
            if pool.is_empty() {
                return Err(CreateCircuitError::InsufficientNodes { role })
            }
            let index = self.strategy.select(&pool)
                .ok_or(CreateCircuitError::InsufficientNodes { role })?;
            let node = pool.get(index)
                .ok_or(CreateCircuitError::InsufficientNodes { role })?
                .clone();
            used.insert(node.id);
            nodes.push(node);
        }

        let circuit = Circuit {
            id: CircuitId::random(),
            nodes,
            created: clock_now(),
        };

        debug!("Created circuit {} through {} nodes", circuit.id, circuit.nodes.len());
        self.circuits.write().await.insert(circuit.id, circuit.clone());

        Ok(circuit)
    }

    /// Get a circuit by its id.
    pub async fn get_circuit(&self, id: CircuitId) -> Option<Circuit> {
        self.circuits.read().await.get(&id).cloned()
    }

    /// Snapshot of all circuits in the table.
    pub async fn list_circuits(&self) -> Vec<Circuit> {
        self.circuits.read().await.values().cloned().collect()
    }

    /// Remove a circuit from the table. Returns `false` if there was no such
    /// circuit.
    pub async fn destroy_circuit(&self, id: CircuitId) -> bool {
        let removed = self.circuits.write().await.remove(&id).is_some();
        if removed {
            debug!("Destroyed circuit {}", id);
        }
        removed
    }
}
