//! Party lifecycle management and the membership index.
//!
//! The manager owns two coupled tables: the primary party table and a reverse
//! index from peer to the parties it belongs to. Both live behind a single
//! reader/writer lock so every mutation keeps them consistent, and the lock is
//! never held across an await or while sending notifications. Lifecycle
//! notifications go out on an event channel consumed by the node.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use libp2p::PeerId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{TssError, TssResult};

pub const MIN_PARTY_SIZE: usize = 3;
pub const MAX_PARTY_SIZE: usize = 10;
pub const PARTY_FORMATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TssOperation {
    KeyGen,
    Signing,
}

impl fmt::Display for TssOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TssOperation::KeyGen => write!(f, "keygen"),
            TssOperation::Signing => write!(f, "signing"),
        }
    }
}

/// `Forming → Ready → Active → {Completed, Failed}`, with a direct
/// `Forming → Failed` edge on formation timeout. Terminal states are never
/// left; reaching one removes the party from all indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyStatus {
    Forming,
    Ready,
    Active,
    Completed,
    Failed,
}

impl PartyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PartyStatus::Completed | PartyStatus::Failed)
    }
}

impl fmt::Display for PartyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartyStatus::Forming => "forming",
            PartyStatus::Ready => "ready",
            PartyStatus::Active => "active",
            PartyStatus::Completed => "completed",
            PartyStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct Party {
    pub id: String,
    /// The member that created the party. Only its readiness notice may
    /// confirm formation on the member side.
    pub initiator: PeerId,
    pub members: Vec<PeerId>,
    pub threshold: usize,
    pub status: PartyStatus,
    pub operation: TssOperation,
}

/// Lifecycle notifications emitted by the formation task. Consumed outside the
/// manager's lock so fan-out sends never block other callers.
#[derive(Debug, Clone)]
pub enum PartyEvent {
    Ready(Party),
    Failed { party_id: String },
}

#[derive(Debug, Clone)]
pub struct PartyConfig {
    pub formation_timeout: Duration,
}

impl Default for PartyConfig {
    fn default() -> Self {
        Self {
            formation_timeout: PARTY_FORMATION_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Tables {
    parties: HashMap<String, Party>,
    peer_parties: HashMap<PeerId, HashSet<String>>,
    /// Members whose formation ack is still outstanding, per forming party.
    /// Absent for parties registered from an invite (those wait for the
    /// initiator's readiness notice instead).
    pending_acks: HashMap<String, HashSet<PeerId>>,
    /// Formation signal per forming party; fired once formation is confirmed.
    formed: HashMap<String, Arc<Notify>>,
}

#[derive(Clone)]
pub struct PartyManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: PartyConfig,
    tables: RwLock<Tables>,
    events: mpsc::UnboundedSender<PartyEvent>,
}

impl PartyManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PartyEvent>) {
        Self::with_config(PartyConfig::default())
    }

    pub fn with_config(config: PartyConfig) -> (Self, mpsc::UnboundedReceiver<PartyEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                tables: RwLock::new(Tables::default()),
                events,
            }),
        };
        (manager, events_rx)
    }

    /// Creates a party in `Forming` status and launches its formation task.
    /// The party and all reverse-index entries are inserted atomically;
    /// formation completion is observed via polling or the event channel.
    pub fn create_party(
        &self,
        initiator: PeerId,
        members: Vec<PeerId>,
        threshold: usize,
        operation: TssOperation,
    ) -> TssResult<Party> {
        validate_party(&members, threshold)?;

        let id = generate_party_id();
        let party = Party {
            id: id.clone(),
            initiator,
            members: members.clone(),
            threshold,
            status: PartyStatus::Forming,
            operation,
        };
        let formed = Arc::new(Notify::new());

        {
            let mut tables = self.write_tables();
            tables.parties.insert(id.clone(), party.clone());
            for member in &members {
                tables
                    .peer_parties
                    .entry(*member)
                    .or_default()
                    .insert(id.clone());
            }
            let pending: HashSet<PeerId> = members
                .iter()
                .copied()
                .filter(|m| *m != initiator)
                .collect();
            tables.pending_acks.insert(id.clone(), pending);
            tables.formed.insert(id.clone(), formed.clone());
        }

        self.spawn_formation(id, formed);
        Ok(party)
    }

    /// Member-side insertion of a party announced by its initiator. The
    /// formation task waits for the initiator's readiness notice. Registering
    /// an already-known party id is a no-op.
    pub fn register_party(&self, party: Party) -> TssResult<()> {
        validate_party(&party.members, party.threshold)?;

        let id = party.id.clone();
        let formed = Arc::new(Notify::new());
        {
            let mut tables = self.write_tables();
            if tables.parties.contains_key(&id) {
                return Ok(());
            }
            for member in &party.members {
                tables
                    .peer_parties
                    .entry(*member)
                    .or_default()
                    .insert(id.clone());
            }
            tables.parties.insert(id.clone(), party);
            tables.formed.insert(id.clone(), formed.clone());
        }

        self.spawn_formation(id, formed);
        Ok(())
    }

    /// Records a formation ack from `member`. Once every non-initiator member
    /// has acked, the formation task is woken and the party becomes `Ready`.
    pub fn record_formation_ack(&self, party_id: &str, member: PeerId) -> TssResult<()> {
        let notify = {
            let mut tables = self.write_tables();
            if !tables.parties.contains_key(party_id) {
                return Err(TssError::NotFound(party_id.to_string()));
            }
            let Some(pending) = tables.pending_acks.get_mut(party_id) else {
                return Ok(());
            };
            pending.remove(&member);
            if pending.is_empty() {
                tables.formed.get(party_id).cloned()
            } else {
                None
            }
        };
        if let Some(notify) = notify {
            notify.notify_one();
        }
        Ok(())
    }

    /// Confirms formation directly (member side, on the initiator's notice).
    /// Only the party's initiator may confirm; anyone else is rejected so a
    /// member cannot flip a forming party to ready ahead of the acks.
    pub fn mark_ready(&self, party_id: &str, from: PeerId) -> TssResult<()> {
        let notify = {
            let tables = self.read_tables();
            let Some(party) = tables.parties.get(party_id) else {
                return Err(TssError::NotFound(party_id.to_string()));
            };
            if party.initiator != from {
                return Err(TssError::Validation(format!(
                    "readiness notice for {party_id} from non-initiator {from}"
                )));
            }
            tables.formed.get(party_id).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_one();
        }
        Ok(())
    }

    /// Direct status transition used by the protocol driver. Terminal states
    /// trigger cleanup of the party and all its reverse-index entries.
    pub fn update_party_status(&self, party_id: &str, status: PartyStatus) -> TssResult<()> {
        let mut tables = self.write_tables();
        let Some(party) = tables.parties.get_mut(party_id) else {
            return Err(TssError::NotFound(party_id.to_string()));
        };
        party.status = status;
        if status.is_terminal() {
            cleanup_party(&mut tables, party_id);
        }
        Ok(())
    }

    pub fn get_party(&self, party_id: &str) -> TssResult<Party> {
        self.read_tables()
            .parties
            .get(party_id)
            .cloned()
            .ok_or_else(|| TssError::NotFound(party_id.to_string()))
    }

    pub fn get_all_parties(&self) -> Vec<Party> {
        self.read_tables().parties.values().cloned().collect()
    }

    pub fn get_peer_parties(&self, peer: &PeerId) -> Vec<String> {
        self.read_tables()
            .peer_parties
            .get(peer)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn spawn_formation(&self, party_id: String, formed: Arc<Notify>) {
        let manager = self.clone();
        let deadline = self.inner.config.formation_timeout;
        tokio::spawn(async move {
            match timeout(deadline, formed.notified()).await {
                Ok(()) => manager.complete_formation(&party_id),
                Err(_) => manager.fail_formation(&party_id),
            }
        });
    }

    fn complete_formation(&self, party_id: &str) {
        let snapshot = {
            let mut tables = self.write_tables();
            tables.pending_acks.remove(party_id);
            tables.formed.remove(party_id);
            match tables.parties.get_mut(party_id) {
                Some(party) if party.status == PartyStatus::Forming => {
                    party.status = PartyStatus::Ready;
                    Some(party.clone())
                }
                _ => None,
            }
        };
        if let Some(party) = snapshot {
            info!(party_id, "party formed");
            let _ = self.inner.events.send(PartyEvent::Ready(party));
        }
    }

    fn fail_formation(&self, party_id: &str) {
        let failed = {
            let mut tables = self.write_tables();
            tables.pending_acks.remove(party_id);
            tables.formed.remove(party_id);
            match tables.parties.get_mut(party_id) {
                Some(party) if party.status == PartyStatus::Forming => {
                    party.status = PartyStatus::Failed;
                    cleanup_party(&mut tables, party_id);
                    true
                }
                _ => false,
            }
        };
        if failed {
            warn!(party_id, "party formation timed out");
            let _ = self.inner.events.send(PartyEvent::Failed {
                party_id: party_id.to_string(),
            });
        }
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the party and every reverse-index membership, dropping reverse
/// entries that become empty. Safe to call for ids already cleaned up.
fn cleanup_party(tables: &mut Tables, party_id: &str) {
    let Some(party) = tables.parties.remove(party_id) else {
        return;
    };
    for member in &party.members {
        if let Some(ids) = tables.peer_parties.get_mut(member) {
            ids.remove(party_id);
            if ids.is_empty() {
                tables.peer_parties.remove(member);
            }
        }
    }
    tables.pending_acks.remove(party_id);
    tables.formed.remove(party_id);
}

fn validate_party(members: &[PeerId], threshold: usize) -> TssResult<()> {
    if members.len() < MIN_PARTY_SIZE || members.len() > MAX_PARTY_SIZE {
        return Err(TssError::Validation(format!(
            "invalid party size: {} (min: {MIN_PARTY_SIZE}, max: {MAX_PARTY_SIZE})",
            members.len()
        )));
    }
    if threshold < 2 || threshold > members.len() {
        return Err(TssError::Validation(format!(
            "invalid threshold: {threshold} (must be between 2 and party size)"
        )));
    }
    Ok(())
}

fn generate_party_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("party-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TssError;
    use std::collections::HashSet;

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n)
            .map(|_| PeerId::from(libp2p::identity::Keypair::generate_ed25519().public()))
            .collect()
    }

    fn manager(timeout: Duration) -> (PartyManager, mpsc::UnboundedReceiver<PartyEvent>) {
        PartyManager::with_config(PartyConfig {
            formation_timeout: timeout,
        })
    }

    #[tokio::test]
    async fn create_party_validates_bounds() {
        let (mgr, _events) = manager(Duration::from_secs(5));
        let members = peers(4);

        for (n, t) in [(2, 2), (11, 5)] {
            let err = mgr
                .create_party(members[0], peers(n), t, TssOperation::KeyGen)
                .unwrap_err();
            assert!(matches!(err, TssError::Validation(_)));
        }
        for t in [0, 1, 5] {
            let err = mgr
                .create_party(members[0], members.clone(), t, TssOperation::KeyGen)
                .unwrap_err();
            assert!(matches!(err, TssError::Validation(_)));
        }

        // Failed creates leave no trace.
        assert!(mgr.get_all_parties().is_empty());
        for m in &members {
            assert!(mgr.get_peer_parties(m).is_empty());
        }
    }

    #[tokio::test]
    async fn create_party_inserts_forming_party_and_index() {
        let (mgr, _events) = manager(Duration::from_secs(5));
        let members = peers(3);

        let party = mgr
            .create_party(members[0], members.clone(), 2, TssOperation::KeyGen)
            .unwrap();
        assert_eq!(party.status, PartyStatus::Forming);
        assert_eq!(party.members.len(), 3);
        assert_eq!(party.threshold, 2);

        let fetched = mgr.get_party(&party.id).unwrap();
        assert_eq!(fetched.status, PartyStatus::Forming);
        for m in &members {
            assert_eq!(mgr.get_peer_parties(m), vec![party.id.clone()]);
        }
    }

    #[tokio::test]
    async fn all_acks_move_party_to_ready() {
        let (mgr, mut events) = manager(Duration::from_secs(5));
        let members = peers(3);

        let party = mgr
            .create_party(members[0], members.clone(), 2, TssOperation::KeyGen)
            .unwrap();
        mgr.record_formation_ack(&party.id, members[1]).unwrap();
        mgr.record_formation_ack(&party.id, members[2]).unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("formation event")
            .expect("channel open");
        match event {
            PartyEvent::Ready(ready) => assert_eq!(ready.id, party.id),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(mgr.get_party(&party.id).unwrap().status, PartyStatus::Ready);
    }

    #[tokio::test]
    async fn formation_timeout_fails_and_cleans_up() {
        let (mgr, mut events) = manager(Duration::from_millis(50));
        let members = peers(3);

        let party = mgr
            .create_party(members[0], members.clone(), 2, TssOperation::Signing)
            .unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("formation event")
            .expect("channel open");
        assert!(matches!(event, PartyEvent::Failed { party_id } if party_id == party.id));

        assert!(matches!(
            mgr.get_party(&party.id),
            Err(TssError::NotFound(_))
        ));
        for m in &members {
            assert!(mgr.get_peer_parties(m).is_empty());
        }
    }

    #[tokio::test]
    async fn mark_ready_confirms_registered_party() {
        let (mgr, mut events) = manager(Duration::from_secs(5));
        let members = peers(3);
        let party = Party {
            id: "party-invited".into(),
            initiator: members[0],
            members: members.clone(),
            threshold: 2,
            status: PartyStatus::Forming,
            operation: TssOperation::KeyGen,
        };

        mgr.register_party(party).unwrap();
        // Acks never confirm an invited party; only the readiness notice does.
        mgr.mark_ready("party-invited", members[0]).unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("formation event")
            .expect("channel open");
        assert!(matches!(event, PartyEvent::Ready(p) if p.id == "party-invited"));
    }

    #[tokio::test]
    async fn mark_ready_rejects_non_initiator() {
        let (mgr, mut events) = manager(Duration::from_secs(5));
        let members = peers(3);
        let party = Party {
            id: "party-invited".into(),
            initiator: members[0],
            members: members.clone(),
            threshold: 2,
            status: PartyStatus::Forming,
            operation: TssOperation::KeyGen,
        };
        mgr.register_party(party).unwrap();

        let err = mgr.mark_ready("party-invited", members[1]).unwrap_err();
        assert!(matches!(err, TssError::Validation(_)));

        // No Ready event, and the party is still forming.
        assert!(events.try_recv().is_err());
        assert_eq!(
            mgr.get_party("party-invited").unwrap().status,
            PartyStatus::Forming
        );
    }

    #[tokio::test]
    async fn terminal_status_removes_party() {
        let (mgr, _events) = manager(Duration::from_secs(5));
        let members = peers(4);

        let party = mgr
            .create_party(members[0], members.clone(), 3, TssOperation::KeyGen)
            .unwrap();
        mgr.update_party_status(&party.id, PartyStatus::Active)
            .unwrap();
        assert_eq!(
            mgr.get_party(&party.id).unwrap().status,
            PartyStatus::Active
        );

        mgr.update_party_status(&party.id, PartyStatus::Completed)
            .unwrap();
        assert!(mgr.get_all_parties().is_empty());
        for m in &members {
            assert!(mgr.get_peer_parties(m).is_empty());
        }

        // Cleanup already happened; a second transition sees nothing.
        assert!(matches!(
            mgr.update_party_status(&party.id, PartyStatus::Failed),
            Err(TssError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_party_is_not_found() {
        let (mgr, _events) = manager(Duration::from_secs(5));
        assert!(matches!(
            mgr.get_party("party-missing"),
            Err(TssError::NotFound(_))
        ));
        assert!(matches!(
            mgr.update_party_status("party-missing", PartyStatus::Active),
            Err(TssError::NotFound(_))
        ));
        assert!(matches!(
            mgr.record_formation_ack("party-missing", peers(1)[0]),
            Err(TssError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_creates_keep_reverse_index_consistent() {
        let (mgr, _events) = manager(Duration::from_secs(30));
        let pool = peers(6);

        let mut handles = Vec::new();
        for i in 0..10 {
            let mgr = mgr.clone();
            let members: Vec<PeerId> = pool.iter().skip(i % 3).take(4).copied().collect();
            handles.push(tokio::spawn(async move {
                mgr.create_party(members[0], members, 2, TssOperation::KeyGen)
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // For every peer, the reverse index must equal exactly the set of live
        // parties that peer belongs to.
        let parties = mgr.get_all_parties();
        assert_eq!(parties.len(), 10);
        for peer in &pool {
            let expected: HashSet<String> = parties
                .iter()
                .filter(|p| p.members.contains(peer))
                .map(|p| p.id.clone())
                .collect();
            let actual: HashSet<String> = mgr.get_peer_parties(peer).into_iter().collect();
            assert_eq!(actual, expected);
        }
    }
}
