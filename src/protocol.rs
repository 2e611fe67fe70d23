//! Message vocabulary of the Rank Matcher protocol.
//!
//! Every message is a variant of the closed [`Message`] union. Each variant
//! wraps a payload struct that knows its own [`MessageType`] tag and the
//! order in which its fields appear on the wire (see [`Payload`]).
//!
//! Commands flow client → server, events flow server → client; both
//! directions share the same tag space and codec so either side can be
//! decoded for testing and diagnostics.
//!
//! Payload structs also derive `serde` traits so applications can forward
//! decoded events to other systems. That representation is independent of
//! the wire format.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{FieldReader, FieldWriter};
use crate::error::DecodeError;
use crate::error_codes::MatchFailureCode;

// ── Message types ───────────────────────────────────────────────────

/// Wire tag of a message variant.
///
/// Tags are stable and never reused across protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    AddArena,
    RemoveArena,
    AddPlayer,
    RemovePlayer,
    GetOrSubscribeState,
    ConnectionState,
    MatchSuccess,
    MatchFailure,
    FormatError,
}

impl MessageType {
    /// Every message type, in tag order.
    pub const ALL: [MessageType; 9] = [
        MessageType::AddArena,
        MessageType::RemoveArena,
        MessageType::AddPlayer,
        MessageType::RemovePlayer,
        MessageType::GetOrSubscribeState,
        MessageType::ConnectionState,
        MessageType::MatchSuccess,
        MessageType::MatchFailure,
        MessageType::FormatError,
    ];

    /// The numeric tag written on the wire.
    pub const fn tag(self) -> u64 {
        match self {
            MessageType::AddArena => 1,
            MessageType::RemoveArena => 2,
            MessageType::AddPlayer => 3,
            MessageType::RemovePlayer => 4,
            MessageType::GetOrSubscribeState => 5,
            MessageType::ConnectionState => 6,
            MessageType::MatchSuccess => 7,
            MessageType::MatchFailure => 8,
            MessageType::FormatError => 9,
        }
    }

    /// Look up the message type for a wire tag.
    ///
    /// Returns `None` for tags this protocol version does not define.
    pub const fn from_tag(tag: u64) -> Option<MessageType> {
        match tag {
            1 => Some(MessageType::AddArena),
            2 => Some(MessageType::RemoveArena),
            3 => Some(MessageType::AddPlayer),
            4 => Some(MessageType::RemovePlayer),
            5 => Some(MessageType::GetOrSubscribeState),
            6 => Some(MessageType::ConnectionState),
            7 => Some(MessageType::MatchSuccess),
            8 => Some(MessageType::MatchFailure),
            9 => Some(MessageType::FormatError),
            _ => None,
        }
    }

    /// `SCREAMING_SNAKE_CASE` name, as used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            MessageType::AddArena => "ADD_ARENA",
            MessageType::RemoveArena => "REMOVE_ARENA",
            MessageType::AddPlayer => "ADD_PLAYER",
            MessageType::RemovePlayer => "REMOVE_PLAYER",
            MessageType::GetOrSubscribeState => "GET_OR_SUBSCRIBE_STATE",
            MessageType::ConnectionState => "CONNECTION_STATE",
            MessageType::MatchSuccess => "MATCH_SUCCESS",
            MessageType::MatchFailure => "MATCH_FAILURE",
            MessageType::FormatError => "FORMAT_ERROR",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Payload trait ───────────────────────────────────────────────────

/// A message payload with a fixed tag and field layout.
pub trait Payload: Sized {
    /// Tag this payload is sent under.
    const TYPE: MessageType;

    /// Append this payload's fields, in declared order.
    fn write_fields(&self, writer: &mut FieldWriter);

    /// Read this payload's fields, in declared order.
    ///
    /// # Errors
    ///
    /// Any [`DecodeError`] raised by the underlying field reads.
    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError>;
}

/// One team entry in a match result: the player who queued and how many
/// seats the team takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEntry {
    pub player: String,
    pub team_length: u64,
}

impl TeamEntry {
    pub fn new(player: impl Into<String>, team_length: u64) -> Self {
        Self {
            player: player.into(),
            team_length,
        }
    }
}

fn write_teams(writer: &mut FieldWriter, teams: &[TeamEntry]) {
    writer.write_number(teams.len() as u64);
    for team in teams {
        writer.write_string(&team.player);
        writer.write_number(team.team_length);
    }
}

fn read_teams(reader: &mut FieldReader<'_>) -> Result<Vec<TeamEntry>, DecodeError> {
    let count = reader.read_number()?;
    let mut teams = Vec::with_capacity(bounded_capacity(count, reader));
    for _ in 0..count {
        let player = reader.read_string()?;
        let team_length = reader.read_number()?;
        teams.push(TeamEntry {
            player,
            team_length,
        });
    }
    Ok(teams)
}

/// Every list entry takes at least one character, so a count larger than
/// the rest of the frame is bogus and must not drive an allocation.
fn bounded_capacity(count: u64, reader: &FieldReader<'_>) -> usize {
    usize::try_from(count)
        .unwrap_or(usize::MAX)
        .min(reader.remaining())
}

// ── Commands ────────────────────────────────────────────────────────

/// Register a matchmaking pool that completes a match at `num_players` seats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddArena {
    pub arena: String,
    pub num_players: u64,
}

impl Payload for AddArena {
    const TYPE: MessageType = MessageType::AddArena;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_string(&self.arena).write_number(self.num_players);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            arena: reader.read_string()?,
            num_players: reader.read_number()?,
        })
    }
}

/// Drop a matchmaking pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveArena {
    pub arena: String,
}

impl Payload for RemoveArena {
    const TYPE: MessageType = MessageType::RemoveArena;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_string(&self.arena);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            arena: reader.read_string()?,
        })
    }
}

/// Queue a player (or a team led by `player`) in an arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPlayer {
    pub arena: String,
    pub player: String,
    pub rank: u64,
    /// Number of seats the team occupies.
    pub length: u64,
    /// Half-width of the initial rank band around `rank`.
    pub init_rank_diff: u64,
    /// How fast the rank band widens while the player waits.
    pub speed: u64,
}

impl AddPlayer {
    /// Initial `(min, max)` rank band, saturating at the `u64` bounds.
    pub fn rank_range(&self) -> (u64, u64) {
        (
            self.rank.saturating_sub(self.init_rank_diff),
            self.rank.saturating_add(self.init_rank_diff),
        )
    }
}

impl Payload for AddPlayer {
    const TYPE: MessageType = MessageType::AddPlayer;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer
            .write_string(&self.arena)
            .write_string(&self.player)
            .write_number(self.rank)
            .write_number(self.length)
            .write_number(self.init_rank_diff)
            .write_number(self.speed);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            arena: reader.read_string()?,
            player: reader.read_string()?,
            rank: reader.read_number()?,
            length: reader.read_number()?,
            init_rank_diff: reader.read_number()?,
            speed: reader.read_number()?,
        })
    }
}

/// Withdraw a queued player from an arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePlayer {
    pub arena: String,
    pub player: String,
}

impl Payload for RemovePlayer {
    const TYPE: MessageType = MessageType::RemovePlayer;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_string(&self.arena).write_string(&self.player);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            arena: reader.read_string()?,
            player: reader.read_string()?,
        })
    }
}

/// Ask for a [`ConnectionState`] snapshot.
///
/// A `period` of 0 requests a single immediate reply and cancels any running
/// subscription; any other value subscribes to a push every `period` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOrSubscribeState {
    pub period: u64,
}

impl GetOrSubscribeState {
    pub fn is_one_shot(&self) -> bool {
        self.period == 0
    }

    /// Push interval, or `None` for a one-shot request.
    pub fn interval(&self) -> Option<Duration> {
        (self.period > 0).then(|| Duration::from_secs(self.period))
    }
}

impl Payload for GetOrSubscribeState {
    const TYPE: MessageType = MessageType::GetOrSubscribeState;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_number(self.period);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            period: reader.read_number()?,
        })
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Where a queued player currently sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub arena: String,
    /// Players currently inside this player's rank band.
    pub num_matched: u64,
}

/// Snapshot of every player this connection has queued.
///
/// Entries are keyed by player name, so re-encoding writes them in name
/// order rather than the order they arrived in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub players: BTreeMap<String, PlayerState>,
}

impl ConnectionState {
    pub fn get(&self, player: &str) -> Option<&PlayerState> {
        self.players.get(player)
    }

    /// Players queued in `arena`, in name order.
    pub fn players_in<'a>(&'a self, arena: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.players
            .iter()
            .filter(move |(_, state)| state.arena == arena)
            .map(|(player, _)| player.as_str())
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

impl Payload for ConnectionState {
    const TYPE: MessageType = MessageType::ConnectionState;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_number(self.players.len() as u64);
        for (player, state) in &self.players {
            writer
                .write_string(player)
                .write_string(&state.arena)
                .write_number(state.num_matched);
        }
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_number()?;
        let mut players = BTreeMap::new();
        for _ in 0..count {
            let player = reader.read_string()?;
            let arena = reader.read_string()?;
            let num_matched = reader.read_number()?;
            // Duplicate names: the later entry wins.
            players.insert(player, PlayerState { arena, num_matched });
        }
        Ok(Self { players })
    }
}

/// A match was formed and a stage was requested for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSuccess {
    pub arena: String,
    pub stage_request_id: u64,
    pub players: Vec<TeamEntry>,
}

impl Payload for MatchSuccess {
    const TYPE: MessageType = MessageType::MatchSuccess;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer
            .write_string(&self.arena)
            .write_number(self.stage_request_id);
        write_teams(writer, &self.players);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            arena: reader.read_string()?,
            stage_request_id: reader.read_number()?,
            players: read_teams(reader)?,
        })
    }
}

/// A match was formed but the stage could not be created.
///
/// The players listed here have already been removed from the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFailure {
    pub arena: String,
    pub error_id: u64,
    pub error_message: String,
    pub players: Vec<TeamEntry>,
}

impl MatchFailure {
    pub fn code(&self) -> MatchFailureCode {
        MatchFailureCode::from_id(self.error_id)
    }
}

impl Payload for MatchFailure {
    const TYPE: MessageType = MessageType::MatchFailure;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer
            .write_string(&self.arena)
            .write_number(self.error_id)
            .write_string(&self.error_message);
        write_teams(writer, &self.players);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            arena: reader.read_string()?,
            error_id: reader.read_number()?,
            error_message: reader.read_string()?,
            players: read_teams(reader)?,
        })
    }
}

/// The server could not parse a frame this client sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatError {
    pub message: String,
}

impl Payload for FormatError {
    const TYPE: MessageType = MessageType::FormatError;

    fn write_fields(&self, writer: &mut FieldWriter) {
        writer.write_string(&self.message);
    }

    fn read_fields(reader: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            message: reader.read_string()?,
        })
    }
}

// ── Message union ───────────────────────────────────────────────────

/// Any Rank Matcher protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    AddArena(AddArena),
    RemoveArena(RemoveArena),
    AddPlayer(AddPlayer),
    RemovePlayer(RemovePlayer),
    GetOrSubscribeState(GetOrSubscribeState),
    ConnectionState(ConnectionState),
    MatchSuccess(MatchSuccess),
    MatchFailure(MatchFailure),
    FormatError(FormatError),
}

impl Message {
    /// The tag this message is sent under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AddArena(_) => AddArena::TYPE,
            Message::RemoveArena(_) => RemoveArena::TYPE,
            Message::AddPlayer(_) => AddPlayer::TYPE,
            Message::RemovePlayer(_) => RemovePlayer::TYPE,
            Message::GetOrSubscribeState(_) => GetOrSubscribeState::TYPE,
            Message::ConnectionState(_) => ConnectionState::TYPE,
            Message::MatchSuccess(_) => MatchSuccess::TYPE,
            Message::MatchFailure(_) => MatchFailure::TYPE,
            Message::FormatError(_) => FormatError::TYPE,
        }
    }

    /// Append the payload fields (no version or tag).
    pub(crate) fn write_payload(&self, writer: &mut FieldWriter) {
        match self {
            Message::AddArena(p) => p.write_fields(writer),
            Message::RemoveArena(p) => p.write_fields(writer),
            Message::AddPlayer(p) => p.write_fields(writer),
            Message::RemovePlayer(p) => p.write_fields(writer),
            Message::GetOrSubscribeState(p) => p.write_fields(writer),
            Message::ConnectionState(p) => p.write_fields(writer),
            Message::MatchSuccess(p) => p.write_fields(writer),
            Message::MatchFailure(p) => p.write_fields(writer),
            Message::FormatError(p) => p.write_fields(writer),
        }
    }

    /// Read the payload of a message of type `kind`.
    pub(crate) fn read_payload(
        kind: MessageType,
        reader: &mut FieldReader<'_>,
    ) -> Result<Message, DecodeError> {
        Ok(match kind {
            MessageType::AddArena => Message::AddArena(AddArena::read_fields(reader)?),
            MessageType::RemoveArena => Message::RemoveArena(RemoveArena::read_fields(reader)?),
            MessageType::AddPlayer => Message::AddPlayer(AddPlayer::read_fields(reader)?),
            MessageType::RemovePlayer => Message::RemovePlayer(RemovePlayer::read_fields(reader)?),
            MessageType::GetOrSubscribeState => {
                Message::GetOrSubscribeState(GetOrSubscribeState::read_fields(reader)?)
            }
            MessageType::ConnectionState => {
                Message::ConnectionState(ConnectionState::read_fields(reader)?)
            }
            MessageType::MatchSuccess => Message::MatchSuccess(MatchSuccess::read_fields(reader)?),
            MessageType::MatchFailure => Message::MatchFailure(MatchFailure::read_fields(reader)?),
            MessageType::FormatError => Message::FormatError(FormatError::read_fields(reader)?),
        })
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(payload: $variant) -> Self {
                    Message::$variant(payload)
                }
            }
        )*
    };
}

impl_from_payload!(
    AddArena,
    RemoveArena,
    AddPlayer,
    RemovePlayer,
    GetOrSubscribeState,
    ConnectionState,
    MatchSuccess,
    MatchFailure,
    FormatError,
);

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_and_round_trip() {
        for (idx, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(kind.tag(), idx as u64 + 1);
            assert_eq!(MessageType::from_tag(kind.tag()), Some(*kind));
        }
        assert_eq!(MessageType::from_tag(0), None);
        assert_eq!(MessageType::from_tag(10), None);
    }

    #[test]
    fn message_type_matches_variant() {
        let msg = Message::from(RemoveArena {
            arena: "a".into(),
        });
        assert_eq!(msg.message_type(), MessageType::RemoveArena);
        assert_eq!(msg.message_type().to_string(), "REMOVE_ARENA");
    }

    #[test]
    fn rank_range_saturates() {
        let player = AddPlayer {
            arena: "a".into(),
            player: "p".into(),
            rank: 5,
            length: 1,
            init_rank_diff: 10,
            speed: 1,
        };
        assert_eq!(player.rank_range(), (0, 15));
    }

    #[test]
    fn subscribe_interval() {
        assert_eq!(GetOrSubscribeState { period: 0 }.interval(), None);
        assert!(GetOrSubscribeState { period: 0 }.is_one_shot());
        assert_eq!(
            GetOrSubscribeState { period: 3 }.interval(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn duplicate_players_keep_last_entry() {
        let mut reader = FieldReader::new("2,3,bob,1,a,1,3,bob,1,b,7");
        let state = ConnectionState::read_fields(&mut reader).unwrap();
        assert_eq!(state.len(), 1);
        let bob = state.get("bob").unwrap();
        assert_eq!(bob.arena, "b");
        assert_eq!(bob.num_matched, 7);
    }

    #[test]
    fn players_in_filters_by_arena() {
        let mut state = ConnectionState::default();
        for (player, arena) in [("amy", "x"), ("bob", "y"), ("cat", "x")] {
            state.players.insert(
                player.into(),
                PlayerState {
                    arena: arena.into(),
                    num_matched: 0,
                },
            );
        }
        let in_x: Vec<_> = state.players_in("x").collect();
        assert_eq!(in_x, vec!["amy", "cat"]);
    }

    #[test]
    fn huge_team_count_does_not_preallocate() {
        let mut reader = FieldReader::new("18446744073709551615,3,bob,1");
        let err = read_teams(&mut reader).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedNumber { .. }));
    }
}
