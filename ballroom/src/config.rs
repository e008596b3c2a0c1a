use std::path::Path;
use std::sync::Arc;

use config::{Config, File, FileFormat};
use serde::Deserialize;
use serde_json::Value;

use crate::access::RoleTable;
use crate::dependency::ModuleClass;
use crate::player::{PlayerData, PropertySpec};
use crate::{Error, Result};
use ballroom_common::NativeRoomConfig;

/// What to do with players whose team is absent from a caller-supplied
/// team ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlistedTeamPolicy {
    /// Collect them in one trailing bucket.
    #[default]
    Append,
    /// Leave them out of the result.
    Drop,
}

/// Role-resolution function: the roles a player currently holds.
pub type RolesFn = Arc<dyn Fn(&PlayerData) -> Vec<String> + Send + Sync>;

/// Everything needed to create a room.
///
/// The data surface can be loaded from a TOML file; module classes and the
/// role-resolution function are code and attach via the builder methods.
#[derive(Clone)]
pub struct RoomOptions {
    pub native: NativeRoomConfig,
    pub roles: RoleTable,
    /// Chat prefix that routes messages into the command layer, e.g. `"!"`.
    pub command_prefix: Option<String>,
    pub properties: Vec<PropertySpec>,
    /// Initial shared room state; must be a JSON object when set.
    pub state: Value,
    pub unlisted_teams: UnlistedTeamPolicy,
    pub modules: Vec<ModuleClass>,
    pub get_roles: Option<RolesFn>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            native: NativeRoomConfig::default(),
            roles: RoleTable::new(),
            command_prefix: None,
            properties: Vec::new(),
            state: Value::Object(Default::default()),
            unlisted_teams: UnlistedTeamPolicy::default(),
            modules: Vec::new(),
            get_roles: None,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RoomOptionsFile {
    native: NativeRoomConfig,
    roles: RoleTable,
    command_prefix: Option<String>,
    properties: Vec<PropertySpec>,
    state: Value,
    unlisted_teams: UnlistedTeamPolicy,
}

impl RoomOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the data surface from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = File::new(
            path.to_str()
                .ok_or_else(|| Error::Config(format!("non-UTF-8 config path {path:?}")))?,
            FileFormat::Toml,
        );
        let loaded = Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| Error::Config(format!("failed to load config: {e}")))?;
        let file: RoomOptionsFile = loaded
            .try_deserialize()
            .map_err(|e| Error::Config(format!("failed to deserialize config: {e}")))?;

        let state = match file.state {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(Error::Config(format!(
                    "room state must be a table, got {other}"
                )))
            }
        };

        Ok(Self {
            native: file.native,
            roles: file.roles,
            command_prefix: file.command_prefix,
            properties: file.properties,
            state,
            unlisted_teams: file.unlisted_teams,
            modules: Vec::new(),
            get_roles: None,
        })
    }

    pub fn with_module(mut self, class: ModuleClass) -> Self {
        self.modules.push(class);
        self
    }

    pub fn with_modules(mut self, classes: impl IntoIterator<Item = ModuleClass>) -> Self {
        self.modules.extend(classes);
        self
    }

    pub fn with_property(mut self, spec: PropertySpec) -> Self {
        self.properties.push(spec);
        self
    }

    pub fn with_roles(mut self, roles: RoleTable) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_roles_fn(
        mut self,
        f: impl Fn(&PlayerData) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.get_roles = Some(Arc::new(f));
        self
    }

    pub fn with_command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.command_prefix = Some(prefix.into());
        self
    }
}
