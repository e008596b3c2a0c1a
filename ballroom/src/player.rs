use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::UnlistedTeamPolicy;
use crate::event_system::EventKey;
use crate::{Error, Result};
use ballroom_common::{NativePlayer, PlayerId, TeamId, Vec2};

/// Declaration of a custom per-player extension field.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    /// Value a freshly connected player starts with.
    #[serde(default)]
    pub default: Value,
    /// Apply writes on the next scheduling tick instead of immediately.
    #[serde(default = "default_deferred")]
    pub deferred: bool,
}

fn default_deferred() -> bool {
    true
}

impl PropertySpec {
    pub fn new(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default,
            deferred: true,
        }
    }

    /// Apply writes synchronously, on the caller's stack.
    pub fn immediate(mut self) -> Self {
        self.deferred = false;
        self
    }
}

/// Mutable state behind a player wrapper.
#[derive(Debug, Clone)]
pub struct PlayerData {
    pub id: PlayerId,
    pub name: String,
    pub team: TeamId,
    pub admin: bool,
    pub position: Option<Vec2>,
    pub auth: String,
    pub conn: String,
    properties: HashMap<String, Value>,
}

impl PlayerData {
    /// Current value of a custom property.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// Identity-stable wrapper around one connected player.
///
/// All events referencing the same id share one wrapper; cloning the handle
/// clones the reference, not the player.
#[derive(Clone)]
pub struct PlayerHandle {
    id: PlayerId,
    data: Arc<RwLock<PlayerData>>,
}

impl PlayerHandle {
    fn new(data: PlayerData) -> Self {
        Self {
            id: data.id,
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn name(&self) -> String {
        self.data.read().name.clone()
    }

    pub fn team(&self) -> TeamId {
        self.data.read().team
    }

    pub fn admin(&self) -> bool {
        self.data.read().admin
    }

    pub fn position(&self) -> Option<Vec2> {
        self.data.read().position
    }

    pub fn auth(&self) -> String {
        self.data.read().auth.clone()
    }

    pub fn conn(&self) -> String {
        self.data.read().conn.clone()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.data.read().property(name).cloned()
    }

    /// Run `f` against the player's current state.
    pub fn with<R>(&self, f: impl FnOnce(&PlayerData) -> R) -> R {
        f(&self.data.read())
    }

    /// Whether two handles refer to the same wrapper.
    pub fn same(&self, other: &PlayerHandle) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub(crate) fn write(&self, f: impl FnOnce(&mut PlayerData)) {
        f(&mut self.data.write());
    }
}

impl fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_struct("Player")
            .field("id", &data.id)
            .field("name", &data.name)
            .field("team", &data.team)
            .finish()
    }
}

/// Drop-filter for player listings.
///
/// Each set field is compared for exact equality; a player matching any set
/// field is excluded from the listing.
#[derive(Debug, Clone, Default)]
pub struct PlayerFilter {
    pub name: Option<String>,
    pub team: Option<TeamId>,
    pub admin: Option<bool>,
}

impl PlayerFilter {
    pub fn excludes(&self, player: &PlayerData) -> bool {
        if self.name.as_deref() == Some(player.name.as_str()) {
            return true;
        }
        if self.team == Some(player.team) {
            return true;
        }
        if self.admin == Some(player.admin) {
            return true;
        }
        false
    }
}

/// One long-lived wrapper per connected player id.
pub(crate) struct PlayerRegistry {
    players: DashMap<PlayerId, PlayerHandle>,
    specs: Vec<PropertySpec>,
}

impl PlayerRegistry {
    pub fn new(specs: Vec<PropertySpec>) -> Self {
        Self {
            players: DashMap::new(),
            specs,
        }
    }

    pub fn spec(&self, name: &str) -> Option<&PropertySpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Fold a native snapshot into the stable wrapper for its id.
    ///
    /// Only the position is refreshed on every event; team and admin are
    /// refreshed only by their own change events, so unrelated native events
    /// cannot clobber state modules rely on.
    pub fn wrap(&self, snapshot: &NativePlayer, event: Option<&EventKey>) -> PlayerHandle {
        if let Some(existing) = self.players.get(&snapshot.id) {
            let handle = existing.clone();
            drop(existing);
            handle.write(|data| {
                data.position = snapshot.position;
                match event {
                    Some(EventKey::PlayerTeamChange) => data.team = snapshot.team,
                    Some(EventKey::PlayerAdminChange) => data.admin = snapshot.admin,
                    _ => {}
                }
            });
            return handle;
        }

        let properties = self
            .specs
            .iter()
            .map(|s| (s.name.clone(), s.default.clone()))
            .collect();
        let handle = PlayerHandle::new(PlayerData {
            id: snapshot.id,
            name: snapshot.name.clone(),
            team: snapshot.team,
            admin: snapshot.admin,
            position: snapshot.position,
            auth: snapshot.auth.clone(),
            conn: snapshot.conn.clone(),
            properties,
        });
        debug!(id = snapshot.id, name = %snapshot.name, "player wrapper created");
        self.players.insert(snapshot.id, handle.clone());
        handle
    }

    pub fn get(&self, id: PlayerId) -> Option<PlayerHandle> {
        self.players.get(&id).map(|h| h.clone())
    }

    /// Discard the wrapper for a departed id.
    pub fn remove(&self, id: PlayerId) -> Option<PlayerHandle> {
        let removed = self.players.remove(&id).map(|(_, h)| h);
        if removed.is_some() {
            debug!(id, "player wrapper discarded");
        }
        removed
    }

    /// Write a custom property, returning whether the value changed.
    ///
    /// Equal writes are silent no-ops so modules can assign unconditionally
    /// without flooding change events.
    pub fn set_property(
        &self,
        player: &PlayerHandle,
        name: &str,
        value: Value,
    ) -> Result<bool> {
        if self.spec(name).is_none() {
            return Err(Error::UnknownProperty(name.to_string()));
        }
        let mut changed = false;
        player.write(|data| {
            if data.properties.get(name) != Some(&value) {
                data.properties.insert(name.to_string(), value);
                changed = true;
            }
        });
        Ok(changed)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }
}

/// Partition players into buckets following a caller-supplied team order.
///
/// Players whose team is absent from `order` go to one trailing bucket under
/// the `Append` policy and are discarded under `Drop`.
pub fn bucket_by_teams(
    players: Vec<PlayerHandle>,
    order: &[TeamId],
    policy: UnlistedTeamPolicy,
) -> Vec<Vec<PlayerHandle>> {
    let mut buckets: Vec<Vec<PlayerHandle>> = match policy {
        UnlistedTeamPolicy::Append => vec![Vec::new(); order.len() + 1],
        UnlistedTeamPolicy::Drop => vec![Vec::new(); order.len()],
    };
    for player in players {
        let team = player.team();
        match order.iter().position(|t| *t == team) {
            Some(index) => buckets[index].push(player),
            None => match policy {
                UnlistedTeamPolicy::Append => buckets[order.len()].push(player),
                UnlistedTeamPolicy::Drop => {}
            },
        }
    }
    buckets
}
