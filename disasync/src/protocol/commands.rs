//! Command catalogue
//!
//! Every message shape exchanged between clients and the relay. Plain
//! commands are fire-and-forget; the query/reply shapes are paired under one
//! command name through [`ParentCommand`].

use crate::protocol::packet::{Exchange, Packet, QueryId};
use crate::types::{Branch, ErrorCode, Repository, Tick};
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque bytes carried after the header of a container packet.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

/// Commands whose body travels as a raw blob instead of header fields.
pub trait Container {
    fn take_content(&mut self) -> Blob;
    fn set_content(&mut self, content: Blob);
}

/// Links a query shape with its reply shape under one command name.
pub trait ParentCommand {
    const NAME: &'static str;
    type Query: fmt::Debug + Send + 'static;
    type Reply: fmt::Debug + Send + 'static;

    fn request(id: QueryId, query: Self::Query) -> Packet;
    fn response(id: QueryId, reply: Self::Reply) -> Packet;

    /// Extracts the reply, handing back any other packet untouched.
    fn into_reply(packet: Packet) -> Result<Self::Reply, Packet>;
}

macro_rules! parent_command {
    ($marker:ident, $name:literal, $query:ty, $reply:ty) => {
        #[derive(Debug)]
        pub enum $marker {}

        impl ParentCommand for $marker {
            const NAME: &'static str = $name;
            type Query = $query;
            type Reply = $reply;

            fn request(id: QueryId, query: $query) -> Packet {
                Packet::$marker(Exchange::Request(id, query))
            }

            fn response(id: QueryId, reply: $reply) -> Packet {
                Packet::$marker(Exchange::Response(id, reply))
            }

            fn into_reply(packet: Packet) -> Result<$reply, Packet> {
                match packet {
                    Packet::$marker(Exchange::Response(_, reply)) => Ok(reply),
                    other => Err(other),
                }
            }
        }
    };
}

parent_command!(GetRepositories, "get_repos", GetRepositoriesQuery, GetRepositoriesReply);
parent_command!(GetBranches, "get_branches", GetBranchesQuery, GetBranchesReply);
parent_command!(NewRepository, "new_repo", NewRepositoryQuery, Ack);
parent_command!(NewBranch, "new_branch", NewBranchQuery, Ack);
parent_command!(UploadDatabase, "upload_db", UploadDatabaseQuery, Ack);
parent_command!(DownloadDatabase, "download_db", DownloadDatabaseQuery, DownloadDatabaseReply);

/// Empty acknowledgement reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRepositoriesQuery {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRepositoriesReply {
    pub repos: Vec<Repository>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBranchesQuery {
    pub repo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBranchesReply {
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRepositoryQuery {
    pub repo: Repository,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBranchQuery {
    pub branch: Branch,
}

/// Uploads the full serialized document of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDatabaseQuery {
    pub repo: String,
    pub branch: String,
    #[serde(skip)]
    pub content: Blob,
}

impl Container for UploadDatabaseQuery {
    fn take_content(&mut self) -> Blob {
        std::mem::take(&mut self.content)
    }

    fn set_content(&mut self, content: Blob) {
        self.content = content;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDatabaseQuery {
    pub repo: String,
    pub branch: String,
}

/// The full serialized document of a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDatabaseReply {
    #[serde(skip)]
    pub content: Blob,
}

impl Container for DownloadDatabaseReply {
    fn take_content(&mut self) -> Blob {
        std::mem::take(&mut self.content)
    }

    fn set_content(&mut self, content: Blob) {
        self.content = content;
    }
}

/// Announces interest in the events of a branch after `tick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub repo: String,
    pub branch: String,
    pub tick: Tick,
    /// Display colour propagated to the other sessions of the branch
    #[serde(default)]
    pub color: Option<u32>,
    /// Echoed back in [`Subscribed`], so the subscriber can tell traffic of
    /// this subscription apart from what was in flight before it.
    #[serde(default)]
    pub epoch: u64,
}

/// Sent before the backlog of a subscription. Everything the relay sends
/// the session afterwards belongs to the subscription with this epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribed {
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    #[serde(default)]
    pub color: Option<u32>,
}

/// Best-effort cursor location broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCursors {
    pub position: u64,
    #[serde(default)]
    pub color: Option<u32>,
}

/// Tick the relay allocated to an event sent by the receiving session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub tick: Tick,
}

/// Sent once the backlog of a subscription has been pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synced {
    pub tick: Tick,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

/// Self-describing dictionary describing one document mutation.
///
/// The relay never looks inside; only the hook layer knows how to apply it.
/// The keys in [`RESERVED_KEYS`] belong to the envelope and cannot be used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPayload(pub BTreeMap<String, Value>);

/// Header keys an event payload shares its map with.
pub const RESERVED_KEYS: [&str; 3] = ["type", "tick", "__id__"];

impl EventPayload {
    pub fn new(event_type: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("event_type".to_string(), Value::Text(event_type.into()));
        Self(fields)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn event_type(&self) -> Option<&str> {
        match self.0.get("event_type") {
            Some(Value::Text(event_type)) => Some(event_type),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The first envelope key this payload would clobber, if any.
    pub fn reserved_key(&self) -> Option<&'static str> {
        RESERVED_KEYS
            .into_iter()
            .find(|key| self.0.contains_key(*key))
    }

    /// Compact binary form stored in the event log.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        serde_cbor::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_cbor::Error> {
        serde_cbor::from_slice(bytes)
    }
}

/// One persisted document mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Allocated by the relay; whatever a client puts here is only a hint
    pub tick: Tick,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(tick: Tick, payload: EventPayload) -> Self {
        Self { tick, payload }
    }
}
