//! SQLite-backed relationship source for the presence engine.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use socialite_presence::{
    MembershipStatus, PartyId, PartyMembership, RelationshipSource, SourceError, UserId,
};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("create {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a user cannot befriend themselves: {0}")]
    SelfFriendship(UserId),
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
}

impl From<StoreError> for SourceError {
    fn from(err: StoreError) -> Self {
        SourceError::Query(err.to_string())
    }
}

trait Context<T> {
    fn context(self, context: &'static str) -> Result<T, StoreError>;
}

impl<T> Context<T> for rusqlite::Result<T> {
    fn context(self, context: &'static str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Sqlite { context, source })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendshipStatus {
    /// Request sent, not yet accepted.
    Sent,
    Confirmed,
}

impl FriendshipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FriendshipStatus::Sent => "sent",
            FriendshipStatus::Confirmed => "confirmed",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "sent" => Ok(FriendshipStatus::Sent),
            "confirmed" => Ok(FriendshipStatus::Confirmed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

fn membership_str(status: MembershipStatus) -> &'static str {
    match status {
        MembershipStatus::Invited => "invited",
        MembershipStatus::Active => "active",
    }
}

fn parse_membership(value: &str) -> Result<MembershipStatus, StoreError> {
    match value {
        "invited" => Ok(MembershipStatus::Invited),
        "active" => Ok(MembershipStatus::Active),
        other => Err(StoreError::UnknownStatus(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friendship {
    pub user1: UserId,
    pub user2: UserId,
    pub status: FriendshipStatus,
}

/// Friendships and party memberships in one SQLite file.
///
/// Friendship pairs are stored with `user1 < user2` so each pair has one row.
pub struct SqliteRelationshipStore {
    conn: Mutex<Connection>,
}

impl SqliteRelationshipStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).context("open relationship db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().context("open relationship db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS friendships (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               user1 TEXT NOT NULL,
               user2 TEXT NOT NULL,
               status TEXT NOT NULL,
               created_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL,
               UNIQUE (user1, user2)
             );
             CREATE TABLE IF NOT EXISTS party_members (
               party_name TEXT NOT NULL,
               user_name TEXT NOT NULL,
               status TEXT NOT NULL,
               created_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL,
               PRIMARY KEY (party_name, user_name)
             );",
        )
        .context("init relationship db")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts or updates the friendship between `a` and `b`.
    pub fn put_friendship(
        &self,
        a: &UserId,
        b: &UserId,
        status: FriendshipStatus,
    ) -> Result<(), StoreError> {
        if a == b {
            return Err(StoreError::SelfFriendship(a.clone()));
        }
        let (user1, user2) = if a < b { (a, b) } else { (b, a) };
        let now = now_ms();
        self.conn()
            .execute(
                "INSERT INTO friendships (user1, user2, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user1, user2) DO UPDATE
                 SET status=excluded.status, updated_at=excluded.updated_at",
                params![user1.as_str(), user2.as_str(), status.as_str(), now],
            )
            .map(|_| ())
            .context("put friendship")
    }

    pub fn delete_friendship(&self, a: &UserId, b: &UserId) -> Result<bool, StoreError> {
        let (user1, user2) = if a < b { (a, b) } else { (b, a) };
        self.conn()
            .execute(
                "DELETE FROM friendships WHERE user1=?1 AND user2=?2",
                params![user1.as_str(), user2.as_str()],
            )
            .map(|changed| changed > 0)
            .context("delete friendship")
    }

    pub fn put_party_membership(
        &self,
        party: &PartyId,
        user: &UserId,
        status: MembershipStatus,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        self.conn()
            .execute(
                "INSERT INTO party_members (party_name, user_name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(party_name, user_name) DO UPDATE
                 SET status=excluded.status, updated_at=excluded.updated_at",
                params![party.as_str(), user.as_str(), membership_str(status), now],
            )
            .map(|_| ())
            .context("put party membership")
    }

    pub fn delete_party_membership(
        &self,
        party: &PartyId,
        user: &UserId,
    ) -> Result<bool, StoreError> {
        self.conn()
            .execute(
                "DELETE FROM party_members WHERE party_name=?1 AND user_name=?2",
                params![party.as_str(), user.as_str()],
            )
            .map(|changed| changed > 0)
            .context("delete party membership")
    }

    /// Every friendship row, ordered by pair.
    pub fn friendships(&self) -> Result<Vec<Friendship>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT user1, user2, status FROM friendships ORDER BY user1, user2")
            .context("list friendships")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("list friendships")?;
        let mut out = Vec::new();
        for row in rows {
            let (user1, user2, status) = row.context("list friendships row")?;
            let (Some(user1), Some(user2)) = (UserId::parse(&user1), UserId::parse(&user2)) else {
                warn!("skipping friendship row with an empty user name");
                continue;
            };
            out.push(Friendship {
                user1,
                user2,
                status: FriendshipStatus::parse(&status)?,
            });
        }
        Ok(out)
    }

    /// Every party membership row, ordered by party then user.
    pub fn party_memberships(&self) -> Result<Vec<PartyMembership>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT party_name, user_name, status FROM party_members
                 ORDER BY party_name, user_name",
            )
            .context("list party members")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("list party members")?;
        let mut out = Vec::new();
        for row in rows {
            let (party, user, status) = row.context("list party members row")?;
            let (Some(party), Some(user)) = (PartyId::parse(&party), UserId::parse(&user)) else {
                warn!("skipping party membership row with an empty name");
                continue;
            };
            out.push(PartyMembership {
                party,
                user,
                status: parse_membership(&status)?,
            });
        }
        Ok(out)
    }

    fn confirmed_friend_lists(&self) -> Result<HashMap<UserId, Vec<UserId>>, StoreError> {
        let mut lists: HashMap<UserId, Vec<UserId>> = HashMap::new();
        for friendship in self.friendships()? {
            if friendship.status != FriendshipStatus::Confirmed {
                continue;
            }
            lists
                .entry(friendship.user1.clone())
                .or_default()
                .push(friendship.user2.clone());
            lists
                .entry(friendship.user2)
                .or_default()
                .push(friendship.user1);
        }
        Ok(lists)
    }

    fn active_party_members(&self) -> Result<HashMap<PartyId, Vec<UserId>>, StoreError> {
        let mut parties: HashMap<PartyId, Vec<UserId>> = HashMap::new();
        for membership in self.party_memberships()? {
            if membership.status == MembershipStatus::Active {
                parties
                    .entry(membership.party)
                    .or_default()
                    .push(membership.user);
            }
        }
        Ok(parties)
    }

    fn membership(
        &self,
        party: &PartyId,
        user: &UserId,
    ) -> Result<Option<PartyMembership>, StoreError> {
        let status = self
            .conn()
            .query_row(
                "SELECT status FROM party_members WHERE party_name=?1 AND user_name=?2",
                params![party.as_str(), user.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("get party membership")?;
        status
            .map(|status| -> Result<PartyMembership, StoreError> {
                Ok(PartyMembership {
                    party: party.clone(),
                    user: user.clone(),
                    status: parse_membership(&status)?,
                })
            })
            .transpose()
    }
}

impl RelationshipSource for SqliteRelationshipStore {
    fn fetch_all_friend_lists(&self) -> Result<HashMap<UserId, Vec<UserId>>, SourceError> {
        Ok(self.confirmed_friend_lists()?)
    }

    fn fetch_all_active_party_memberships(
        &self,
    ) -> Result<HashMap<PartyId, Vec<UserId>>, SourceError> {
        Ok(self.active_party_members()?)
    }

    fn fetch_party_membership(
        &self,
        party: &PartyId,
        user: &UserId,
    ) -> Result<Option<PartyMembership>, SourceError> {
        Ok(self.membership(party, user)?)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
