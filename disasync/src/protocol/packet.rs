//! Packet envelope and tag-based dispatch
//!
//! On the wire a packet is a map of named fields carrying its type tag under
//! `type` and, for queries and replies, its correlation identifier under
//! `__id__`. Decoding resolves the tag through [`REGISTRY`]; a tag that is
//! not registered is a [`ProtocolError`].

use crate::protocol::commands::*;
use crate::types::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Header fields of a packet, by name.
pub type Fields = BTreeMap<String, Value>;

const TYPE_FIELD: &str = "type";
const ID_FIELD: &str = "__id__";
const TICK_FIELD: &str = "tick";

/// Correlates a query with its reply. Unique for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The two steps of a query/reply command.
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange<Q, R> {
    Request(QueryId, Q),
    Response(QueryId, R),
}

impl<Q, R> Exchange<Q, R> {
    pub fn id(&self) -> QueryId {
        match self {
            Exchange::Request(id, _) | Exchange::Response(id, _) => *id,
        }
    }
}

/// Every message that can travel between a client and the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Subscribe(Subscribe),
    Subscribed(Subscribed),
    Unsubscribe(Unsubscribe),
    UpdateCursors(UpdateCursors),
    Event(Event),
    Committed(Committed),
    Synced(Synced),
    GetRepositories(Exchange<GetRepositoriesQuery, GetRepositoriesReply>),
    GetBranches(Exchange<GetBranchesQuery, GetBranchesReply>),
    NewRepository(Exchange<NewRepositoryQuery, Ack>),
    NewBranch(Exchange<NewBranchQuery, Ack>),
    UploadDatabase(Exchange<UploadDatabaseQuery, Ack>),
    DownloadDatabase(Exchange<DownloadDatabaseQuery, DownloadDatabaseReply>),
    /// Failure report; with an id it answers that query.
    Error(Option<QueryId>, ErrorReply),
}

/// Packet body as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Everything lives in the header map.
    Structured,
    /// The header is followed by an opaque length-prefixed blob.
    Container(Blob),
}

/// An encoded packet ready to be framed.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Fields,
    pub payload: Payload,
}

/// One entry of the tag → decoder table.
pub struct PacketKind {
    pub tag: &'static str,
    pub container: bool,
    decode: fn(Header) -> Result<Packet, ProtocolError>,
}

impl fmt::Debug for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKind")
            .field("tag", &self.tag)
            .field("container", &self.container)
            .finish()
    }
}

mod tag {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const UPDATE_CURSORS: &str = "update_cursors";
    pub const EVENT: &str = "event";
    pub const COMMITTED: &str = "committed";
    pub const SYNCED: &str = "synced";
    pub const ERROR: &str = "error";
    pub const GET_REPOS_QUERY: &str = "get_repos_query";
    pub const GET_REPOS_REPLY: &str = "get_repos_reply";
    pub const GET_BRANCHES_QUERY: &str = "get_branches_query";
    pub const GET_BRANCHES_REPLY: &str = "get_branches_reply";
    pub const NEW_REPO_QUERY: &str = "new_repo_query";
    pub const NEW_REPO_REPLY: &str = "new_repo_reply";
    pub const NEW_BRANCH_QUERY: &str = "new_branch_query";
    pub const NEW_BRANCH_REPLY: &str = "new_branch_reply";
    pub const UPLOAD_DB_QUERY: &str = "upload_db_query";
    pub const UPLOAD_DB_REPLY: &str = "upload_db_reply";
    pub const DOWNLOAD_DB_QUERY: &str = "download_db_query";
    pub const DOWNLOAD_DB_REPLY: &str = "download_db_reply";
}

/// Every packet kind understood by this protocol version.
pub static REGISTRY: &[PacketKind] = &[
    PacketKind {
        tag: tag::SUBSCRIBE,
        container: false,
        decode: |h| Ok(Packet::Subscribe(h.into_command()?)),
    },
    PacketKind {
        tag: tag::SUBSCRIBED,
        container: false,
        decode: |h| Ok(Packet::Subscribed(h.into_command()?)),
    },
    PacketKind {
        tag: tag::UNSUBSCRIBE,
        container: false,
        decode: |h| Ok(Packet::Unsubscribe(h.into_command()?)),
    },
    PacketKind {
        tag: tag::UPDATE_CURSORS,
        container: false,
        decode: |h| Ok(Packet::UpdateCursors(h.into_command()?)),
    },
    PacketKind {
        tag: tag::EVENT,
        container: false,
        decode: |h| Ok(Packet::Event(h.parse_event()?)),
    },
    PacketKind {
        tag: tag::COMMITTED,
        container: false,
        decode: |h| Ok(Packet::Committed(h.into_command()?)),
    },
    PacketKind {
        tag: tag::SYNCED,
        container: false,
        decode: |h| Ok(Packet::Synced(h.into_command()?)),
    },
    PacketKind {
        tag: tag::ERROR,
        container: false,
        decode: |h| Ok(Packet::Error(h.id, h.into_command()?)),
    },
    PacketKind {
        tag: tag::GET_REPOS_QUERY,
        container: false,
        decode: |h| Ok(Packet::GetRepositories(Exchange::Request(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::GET_REPOS_REPLY,
        container: false,
        decode: |h| Ok(Packet::GetRepositories(Exchange::Response(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::GET_BRANCHES_QUERY,
        container: false,
        decode: |h| Ok(Packet::GetBranches(Exchange::Request(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::GET_BRANCHES_REPLY,
        container: false,
        decode: |h| Ok(Packet::GetBranches(Exchange::Response(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::NEW_REPO_QUERY,
        container: false,
        decode: |h| Ok(Packet::NewRepository(Exchange::Request(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::NEW_REPO_REPLY,
        container: false,
        decode: |h| Ok(Packet::NewRepository(Exchange::Response(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::NEW_BRANCH_QUERY,
        container: false,
        decode: |h| Ok(Packet::NewBranch(Exchange::Request(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::NEW_BRANCH_REPLY,
        container: false,
        decode: |h| Ok(Packet::NewBranch(Exchange::Response(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::UPLOAD_DB_QUERY,
        container: true,
        decode: |h| {
            Ok(Packet::UploadDatabase(Exchange::Request(
                h.id()?,
                h.parse_container()?,
            )))
        },
    },
    PacketKind {
        tag: tag::UPLOAD_DB_REPLY,
        container: false,
        decode: |h| Ok(Packet::UploadDatabase(Exchange::Response(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::DOWNLOAD_DB_QUERY,
        container: false,
        decode: |h| Ok(Packet::DownloadDatabase(Exchange::Request(h.id()?, h.into_command()?))),
    },
    PacketKind {
        tag: tag::DOWNLOAD_DB_REPLY,
        container: true,
        decode: |h| {
            Ok(Packet::DownloadDatabase(Exchange::Response(
                h.id()?,
                h.parse_container()?,
            )))
        },
    },
];

/// Looks up the registered kind of a tag.
pub fn kind_of(tag: &str) -> Option<&'static PacketKind> {
    REGISTRY.iter().find(|kind| kind.tag == tag)
}

/// A received header whose tag has been resolved, plus its container body
/// once that has been read.
#[derive(Debug)]
pub struct Header {
    kind: &'static PacketKind,
    id: Option<QueryId>,
    fields: Fields,
    content: Option<Blob>,
}

impl Header {
    /// Parses the structured part of a packet.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut fields: Fields =
            serde_cbor::from_slice(bytes).map_err(|_| ProtocolError::NotAMap)?;

        let tag = match fields.remove(TYPE_FIELD) {
            Some(Value::Text(tag)) => tag,
            _ => return Err(ProtocolError::MissingField(TYPE_FIELD)),
        };
        let kind = kind_of(&tag).ok_or(ProtocolError::UnknownType(tag))?;

        let id = match fields.remove(ID_FIELD) {
            Some(Value::Integer(id)) => Some(QueryId(
                u64::try_from(id).map_err(|_| ProtocolError::MissingField(ID_FIELD))?,
            )),
            Some(_) => return Err(ProtocolError::MissingField(ID_FIELD)),
            None => None,
        };

        Ok(Self {
            kind,
            id,
            fields,
            content: None,
        })
    }

    pub fn kind(&self) -> &'static PacketKind {
        self.kind
    }

    pub fn query_id(&self) -> Option<QueryId> {
        self.id
    }

    pub fn set_content(&mut self, content: Blob) {
        self.content = Some(content);
    }

    /// Builds the packet through the decoder registered for its tag.
    pub fn into_packet(self) -> Result<Packet, ProtocolError> {
        (self.kind.decode)(self)
    }

    fn id(&self) -> Result<QueryId, ProtocolError> {
        self.id.ok_or(ProtocolError::MissingField(ID_FIELD))
    }

    fn into_command<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        from_fields(self.kind.tag, self.fields)
    }

    fn parse_container<T: DeserializeOwned + Container>(mut self) -> Result<T, ProtocolError> {
        let content = self.content.take().unwrap_or_default();
        let mut command: T = self.into_command()?;
        command.set_content(content);
        Ok(command)
    }

    fn parse_event(mut self) -> Result<Event, ProtocolError> {
        let tick = match self.fields.remove(TICK_FIELD) {
            Some(tick) => serde_cbor::value::from_value(tick).map_err(|source| {
                ProtocolError::Malformed {
                    tag: self.kind.tag.to_string(),
                    source,
                }
            })?,
            None => 0,
        };
        Ok(Event::new(tick, EventPayload(self.fields)))
    }
}

impl Packet {
    /// The type tag this packet is sent under.
    pub fn tag(&self) -> &'static str {
        match self {
            Packet::Subscribe(_) => tag::SUBSCRIBE,
            Packet::Subscribed(_) => tag::SUBSCRIBED,
            Packet::Unsubscribe(_) => tag::UNSUBSCRIBE,
            Packet::UpdateCursors(_) => tag::UPDATE_CURSORS,
            Packet::Event(_) => tag::EVENT,
            Packet::Committed(_) => tag::COMMITTED,
            Packet::Synced(_) => tag::SYNCED,
            Packet::Error(..) => tag::ERROR,
            Packet::GetRepositories(Exchange::Request(..)) => tag::GET_REPOS_QUERY,
            Packet::GetRepositories(Exchange::Response(..)) => tag::GET_REPOS_REPLY,
            Packet::GetBranches(Exchange::Request(..)) => tag::GET_BRANCHES_QUERY,
            Packet::GetBranches(Exchange::Response(..)) => tag::GET_BRANCHES_REPLY,
            Packet::NewRepository(Exchange::Request(..)) => tag::NEW_REPO_QUERY,
            Packet::NewRepository(Exchange::Response(..)) => tag::NEW_REPO_REPLY,
            Packet::NewBranch(Exchange::Request(..)) => tag::NEW_BRANCH_QUERY,
            Packet::NewBranch(Exchange::Response(..)) => tag::NEW_BRANCH_REPLY,
            Packet::UploadDatabase(Exchange::Request(..)) => tag::UPLOAD_DB_QUERY,
            Packet::UploadDatabase(Exchange::Response(..)) => tag::UPLOAD_DB_REPLY,
            Packet::DownloadDatabase(Exchange::Request(..)) => tag::DOWNLOAD_DB_QUERY,
            Packet::DownloadDatabase(Exchange::Response(..)) => tag::DOWNLOAD_DB_REPLY,
        }
    }

    /// The query this packet answers, if it is a reply.
    pub fn reply_to(&self) -> Option<QueryId> {
        match self {
            Packet::Error(id, _) => *id,
            Packet::GetRepositories(Exchange::Response(id, _))
            | Packet::GetBranches(Exchange::Response(id, _))
            | Packet::NewRepository(Exchange::Response(id, _))
            | Packet::NewBranch(Exchange::Response(id, _))
            | Packet::UploadDatabase(Exchange::Response(id, _))
            | Packet::DownloadDatabase(Exchange::Response(id, _)) => Some(*id),
            _ => None,
        }
    }

    /// The correlation identifier of a query, its reply or an error reply.
    pub fn query_id(&self) -> Option<QueryId> {
        match self {
            Packet::Error(id, _) => *id,
            Packet::GetRepositories(exchange) => Some(exchange.id()),
            Packet::GetBranches(exchange) => Some(exchange.id()),
            Packet::NewRepository(exchange) => Some(exchange.id()),
            Packet::NewBranch(exchange) => Some(exchange.id()),
            Packet::UploadDatabase(exchange) => Some(exchange.id()),
            Packet::DownloadDatabase(exchange) => Some(exchange.id()),
            _ => None,
        }
    }

    /// Whether the packet travels with a container body.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Packet::UploadDatabase(Exchange::Request(..))
                | Packet::DownloadDatabase(Exchange::Response(..))
        )
    }

    /// Encodes the packet into its header map and optional container body.
    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        let tag = self.tag();
        match self {
            Packet::Subscribe(command) => structured(tag, None, &command),
            Packet::Subscribed(command) => structured(tag, None, &command),
            Packet::Unsubscribe(command) => structured(tag, None, &command),
            Packet::UpdateCursors(command) => structured(tag, None, &command),
            Packet::Committed(command) => structured(tag, None, &command),
            Packet::Synced(command) => structured(tag, None, &command),
            Packet::Error(id, reply) => structured(tag, id, &reply),
            Packet::Event(event) => {
                let mut header = event.payload.0;
                header.insert(TICK_FIELD.to_string(), Value::Integer(event.tick.into()));
                Ok(Frame {
                    header: stamp(header, tag, None),
                    payload: Payload::Structured,
                })
            }
            Packet::GetRepositories(exchange) => exchange_frame(tag, exchange),
            Packet::GetBranches(exchange) => exchange_frame(tag, exchange),
            Packet::NewRepository(exchange) => exchange_frame(tag, exchange),
            Packet::NewBranch(exchange) => exchange_frame(tag, exchange),
            Packet::UploadDatabase(Exchange::Request(id, query)) => {
                container(tag, id, query)
            }
            Packet::UploadDatabase(Exchange::Response(id, reply)) => {
                structured(tag, Some(id), &reply)
            }
            Packet::DownloadDatabase(Exchange::Request(id, query)) => {
                structured(tag, Some(id), &query)
            }
            Packet::DownloadDatabase(Exchange::Response(id, reply)) => {
                container(tag, id, reply)
            }
        }
    }
}

fn exchange_frame<Q: Serialize, R: Serialize>(
    tag: &'static str,
    exchange: Exchange<Q, R>,
) -> Result<Frame, ProtocolError> {
    match exchange {
        Exchange::Request(id, query) => structured(tag, Some(id), &query),
        Exchange::Response(id, reply) => structured(tag, Some(id), &reply),
    }
}

fn structured<T: Serialize>(
    tag: &'static str,
    id: Option<QueryId>,
    command: &T,
) -> Result<Frame, ProtocolError> {
    Ok(Frame {
        header: stamp(to_fields(tag, command)?, tag, id),
        payload: Payload::Structured,
    })
}

fn container<T: Serialize + Container>(
    tag: &'static str,
    id: QueryId,
    mut command: T,
) -> Result<Frame, ProtocolError> {
    let content = command.take_content();
    Ok(Frame {
        header: stamp(to_fields(tag, &command)?, tag, Some(id)),
        payload: Payload::Container(content),
    })
}

fn stamp(mut header: Fields, tag: &'static str, id: Option<QueryId>) -> Fields {
    header.insert(TYPE_FIELD.to_string(), Value::Text(tag.to_string()));
    if let Some(QueryId(id)) = id {
        header.insert(ID_FIELD.to_string(), Value::Integer(id.into()));
    }
    header
}

fn to_fields<T: Serialize>(tag: &str, command: &T) -> Result<Fields, ProtocolError> {
    let value = serde_cbor::value::to_value(command).map_err(|source| ProtocolError::Malformed {
        tag: tag.to_string(),
        source,
    })?;

    match value {
        Value::Map(map) => map
            .into_iter()
            .map(|(key, value)| match key {
                Value::Text(key) => Ok((key, value)),
                _ => Err(ProtocolError::NotAMap),
            })
            .collect(),
        _ => Err(ProtocolError::NotAMap),
    }
}

fn from_fields<T: DeserializeOwned>(tag: &str, fields: Fields) -> Result<T, ProtocolError> {
    let map = fields
        .into_iter()
        .map(|(key, value)| (Value::Text(key), value))
        .collect();

    serde_cbor::value::from_value(Value::Map(map)).map_err(|source| ProtocolError::Malformed {
        tag: tag.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(frame: Frame) -> Result<Packet, ProtocolError> {
        let bytes = serde_cbor::to_vec(&frame.header).unwrap();
        let mut header = Header::parse(&bytes)?;
        if let Payload::Container(content) = frame.payload {
            header.set_content(content);
        }
        header.into_packet()
    }

    #[test]
    fn every_registered_tag_is_unique() {
        let mut tags: Vec<_> = REGISTRY.iter().map(|kind| kind.tag).collect();
        tags.sort_unstable();
        tags.dedup();

        assert_eq!(tags.len(), REGISTRY.len());
    }

    #[test]
    fn container_packets_match_their_registered_kind() {
        let upload = Packet::UploadDatabase(Exchange::Request(
            QueryId(1),
            UploadDatabaseQuery {
                repo: "repoX".to_string(),
                branch: "main".to_string(),
                content: Blob::default(),
            },
        ));
        let download = Packet::DownloadDatabase(Exchange::Request(
            QueryId(2),
            DownloadDatabaseQuery {
                repo: "repoX".to_string(),
                branch: "main".to_string(),
            },
        ));

        for packet in [upload, download] {
            let kind = kind_of(packet.tag()).unwrap();
            assert_eq!(packet.is_container(), kind.container);
        }
    }

    #[test]
    fn query_carries_tag_and_id_in_header() {
        let frame = Packet::GetBranches(Exchange::Request(
            QueryId(7),
            GetBranchesQuery {
                repo: "repoX".to_string(),
            },
        ))
        .into_frame()
        .unwrap();

        assert_eq!(
            frame.header.get("type"),
            Some(&Value::Text("get_branches_query".to_string()))
        );
        assert_eq!(frame.header.get("__id__"), Some(&Value::Integer(7)));
        assert_eq!(
            frame.header.get("repo"),
            Some(&Value::Text("repoX".to_string()))
        );
        assert_eq!(frame.payload, Payload::Structured);
    }

    #[test]
    fn container_body_is_kept_out_of_the_header() {
        let packet = Packet::UploadDatabase(Exchange::Request(
            QueryId(1),
            UploadDatabaseQuery {
                repo: "repoX".to_string(),
                branch: "main".to_string(),
                content: Blob(vec![1, 2, 3]),
            },
        ));

        let frame = packet.clone().into_frame().unwrap();

        assert!(!frame.header.contains_key("content"));
        assert_eq!(frame.payload, Payload::Container(Blob(vec![1, 2, 3])));
        assert!(kind_of("upload_db_query").unwrap().container);
        assert_eq!(decode(frame).unwrap(), packet);
    }

    #[test]
    fn event_fields_are_flattened_next_to_the_tick() {
        let packet = Packet::Event(Event::new(
            12,
            EventPayload::new("make_code").with("ea", 4096u64),
        ));

        let frame = packet.clone().into_frame().unwrap();

        assert_eq!(frame.header.get("tick"), Some(&Value::Integer(12)));
        assert_eq!(
            frame.header.get("event_type"),
            Some(&Value::Text("make_code".to_string()))
        );
        assert_eq!(decode(frame).unwrap(), packet);
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut header = Fields::new();
        header.insert("type".to_string(), Value::Text("launch_missiles".to_string()));
        let bytes = serde_cbor::to_vec(&header).unwrap();

        let error = Header::parse(&bytes).unwrap_err();

        assert!(matches!(error, ProtocolError::UnknownType(tag) if tag == "launch_missiles"));
    }

    #[test]
    fn header_without_tag_is_rejected() {
        let bytes = serde_cbor::to_vec(&Fields::new()).unwrap();

        assert!(matches!(
            Header::parse(&bytes),
            Err(ProtocolError::MissingField("type"))
        ));
    }

    #[test]
    fn query_without_id_is_rejected() {
        let mut header = Fields::new();
        header.insert("type".to_string(), Value::Text("get_repos_query".to_string()));
        let bytes = serde_cbor::to_vec(&header).unwrap();

        let error = Header::parse(&bytes).unwrap().into_packet().unwrap_err();

        assert!(matches!(error, ProtocolError::MissingField("__id__")));
    }

    #[test]
    fn reply_to_only_reports_replies() {
        let query = Packet::GetRepositories(Exchange::Request(QueryId(1), GetRepositoriesQuery {}));
        let reply = Packet::NewBranch(Exchange::Response(QueryId(2), Ack {}));
        let error = Packet::Error(
            Some(QueryId(3)),
            ErrorReply {
                code: crate::types::ErrorCode::NotFound,
                message: "no such repository".to_string(),
            },
        );

        assert_eq!(query.reply_to(), None);
        assert_eq!(reply.reply_to(), Some(QueryId(2)));
        assert_eq!(error.reply_to(), Some(QueryId(3)));
    }
}
