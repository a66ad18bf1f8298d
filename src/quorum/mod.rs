//! Quorum Membership
//!
//! The quorum is the set of client identifiers currently admitted to a
//! document session, maintained by the relay through sequenced Join and
//! Leave ops. The connection handler reads membership through `get_member`
//! and observes changes through typed listeners.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::protocol::ClientId;

/// Listener invoked with the client id of a membership change
pub type MemberListener = Box<dyn Fn(&ClientId) + Send + Sync>;

/// A member of the quorum
pub struct QuorumMember {
    client_id: ClientId,
    should_have_left: AtomicBool,
}

impl QuorumMember {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            should_have_left: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// True once a newer connection has been promoted over this member.
    /// Any op still sequenced under this identifier is stale.
    pub fn should_have_left(&self) -> bool {
        self.should_have_left.load(Ordering::SeqCst)
    }

    pub fn mark_should_have_left(&self) {
        self.should_have_left.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for QuorumMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuorumMember")
            .field("client_id", &self.client_id)
            .field("should_have_left", &self.should_have_left())
            .finish()
    }
}

/// Read and observe quorum membership
pub trait QuorumClients: Send + Sync {
    /// Look up a member by client id
    fn get_member(&self, client_id: &str) -> Option<Arc<QuorumMember>>;

    /// Register a listener for sequenced Join ops
    fn on_member_added(&self, listener: MemberListener);

    /// Register a listener for sequenced Leave ops
    fn on_member_removed(&self, listener: MemberListener);
}

/// Thread-safe in-memory quorum
pub struct QuorumStore {
    members: DashMap<ClientId, Arc<QuorumMember>>,
    added: Mutex<Vec<MemberListener>>,
    removed: Mutex<Vec<MemberListener>>,
}

impl QuorumStore {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Apply a sequenced Join op
    pub fn add_member(&self, client_id: impl Into<ClientId>) {
        let client_id: ClientId = client_id.into();
        let member = Arc::new(QuorumMember::new(client_id.clone()));
        self.members.insert(client_id.clone(), member);
        debug!("member {} joined the quorum", client_id);
        for listener in self.added.lock().iter() {
            listener(&client_id);
        }
    }

    /// Apply a sequenced Leave op
    pub fn remove_member(&self, client_id: &str) {
        if let Some((client_id, _)) = self.members.remove(client_id) {
            debug!("member {} left the quorum", client_id);
            for listener in self.removed.lock().iter() {
                listener(&client_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Default for QuorumStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuorumClients for QuorumStore {
    fn get_member(&self, client_id: &str) -> Option<Arc<QuorumMember>> {
        self.members.get(client_id).map(|member| member.clone())
    }

    fn on_member_added(&self, listener: MemberListener) {
        self.added.lock().push(listener);
    }

    fn on_member_removed(&self, listener: MemberListener) {
        self.removed.lock().push(listener);
    }
}
