use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info};

use crate::access::{AccessPredicate, RoleTable};
use crate::player::PlayerHandle;
use crate::room::Room;
use crate::{Error, Result};

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[a-z0-9_-]+$").unwrap();
}

/// Command handler function signature.
pub type CommandHandler = Box<dyn Fn(&Room, &PlayerHandle, &[String]) -> Result<()> + Send + Sync>;

/// Command declaration inside a module class.
///
/// The handler is a plain method pointer; the resolver binds it to the
/// module instance when the module is constructed.
pub struct CommandSpec<M> {
    pub names: &'static [&'static str],
    pub access: Option<&'static str>,
    pub description: Option<&'static str>,
    pub handler: fn(&M, &Room, &PlayerHandle, &[String]) -> Result<()>,
}

/// Free-standing command definition for [`Room::register_command`].
pub struct CommandDef {
    pub names: Vec<String>,
    pub access: Option<String>,
    pub description: Option<String>,
    pub owner: Option<&'static str>,
    pub handler: CommandHandler,
}

impl CommandDef {
    pub fn new(
        names: impl IntoIterator<Item = impl Into<String>>,
        handler: impl Fn(&Room, &PlayerHandle, &[String]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            access: None,
            description: None,
            owner: None,
            handler: Box::new(handler),
        }
    }

    pub fn with_access(mut self, access: impl Into<String>) -> Self {
        self.access = Some(access.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An immutable registered command.
pub struct Command {
    names: Vec<String>,
    access: AccessPredicate,
    description: Option<String>,
    owner: Option<&'static str>,
    handler: CommandHandler,
}

impl Command {
    /// All lowercase aliases of this command.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Name of the module that registered the command, if any.
    pub fn owner(&self) -> Option<&'static str> {
        self.owner
    }

    pub fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub(crate) fn access(&self) -> &AccessPredicate {
        &self.access
    }

    pub(crate) fn execute(
        &self,
        room: &Room,
        player: &PlayerHandle,
        args: &[String],
    ) -> Result<()> {
        (self.handler)(room, player, args)
    }
}

/// Command metadata record, for help listings.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInfo {
    pub names: Vec<String>,
    pub description: Option<String>,
}

/// Split a raw command line into argument tokens.
///
/// Tokens are whitespace-separated; single- or double-quoted tokens may
/// contain whitespace, and a backslash escapes the closing quote character
/// inside them.
pub fn tokenize(raw: &str) -> Vec<String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let mut arg = String::new();
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            while i < chars.len() && chars[i] != quote {
                let mut ch = chars[i];
                if ch == '\\' && chars.get(i + 1) == Some(&quote) {
                    i += 1;
                    ch = chars[i];
                }
                arg.push(ch);
                i += 1;
            }
            // move past the closing quote, if the string wasn't cut short
            if i < chars.len() {
                i += 1;
            }
        } else {
            while i < chars.len() && !chars[i].is_whitespace() {
                arg.push(chars[i]);
                i += 1;
            }
        }
        if !arg.is_empty() {
            args.push(arg);
        }
    }
    args
}

/// Name → command lookup table; many names may map to one command.
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, Arc<Command>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }

    /// Register a command under every one of its names.
    ///
    /// Registration is atomic: if any name is taken or invalid, nothing is
    /// inserted and previously registered commands are untouched.
    pub fn register(&self, def: CommandDef, roles: &RoleTable) -> Result<()> {
        if def.names.is_empty() {
            return Err(Error::InvalidCommand(
                "a command must have at least one name".to_string(),
            ));
        }
        let mut names = Vec::with_capacity(def.names.len());
        for name in &def.names {
            let name = name.trim().to_lowercase();
            if !NAME_RE.is_match(&name) {
                return Err(Error::InvalidCommand(format!(
                    "invalid command name {name:?}"
                )));
            }
            if names.contains(&name) {
                return Err(Error::InvalidCommand(format!(
                    "command name {name:?} repeated in one definition"
                )));
            }
            names.push(name);
        }

        let access = match &def.access {
            Some(expr) => AccessPredicate::compile(expr, roles)?,
            None => AccessPredicate::allow_all(),
        };

        let mut commands = self.commands.write();
        if let Some(taken) = names.iter().find(|n| commands.contains_key(*n)) {
            return Err(Error::DuplicateCommandName(taken.clone()));
        }

        let command = Arc::new(Command {
            names: names.clone(),
            access,
            description: def.description,
            owner: def.owner,
            handler: def.handler,
        });
        for name in &names {
            commands.insert(name.clone(), Arc::clone(&command));
        }
        info!(names = ?names, owner = ?def.owner, "command registered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.read().get(&name.to_lowercase()).cloned()
    }

    /// Tokenize and dispatch a raw command line with access control.
    pub fn execute(&self, room: &Room, player: &PlayerHandle, raw: &str) -> Result<()> {
        let mut args = tokenize(raw);
        if args.is_empty() {
            return Ok(());
        }
        let name = args[0].to_lowercase();
        args[0] = name.clone();

        let command = self
            .get(&name)
            .ok_or_else(|| Error::UnknownCommand(name.clone()))?;

        let role_names = room.roles_of(player);
        if !command.access().grants(&role_names, room.role_table()) {
            return Err(Error::AccessDenied(name));
        }

        debug!(command = %name, player = player.id(), "executing command");
        command.execute(room, player, &args)
    }

    /// Metadata of registered commands, optionally narrowed to one name.
    pub fn info(&self, name: Option<&str>) -> Vec<CommandInfo> {
        let commands = self.commands.read();
        let mut seen: Vec<*const Command> = Vec::new();
        let mut infos = Vec::new();
        for command in commands.values() {
            let ptr = Arc::as_ptr(command);
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            if let Some(filter) = name {
                if !command.matches(&filter.to_lowercase()) {
                    continue;
                }
            }
            infos.push(CommandInfo {
                names: command.names().to_vec(),
                description: command.description().map(String::from),
            });
        }
        infos.sort_by(|a, b| a.names.cmp(&b.names));
        infos
    }

    /// Number of distinct registered names (aliases counted separately).
    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> CommandHandler {
        Box::new(|_, _, _| Ok(()))
    }

    fn def(names: &[&str]) -> CommandDef {
        CommandDef {
            names: names.iter().map(|s| s.to_string()).collect(),
            access: None,
            description: None,
            owner: None,
            handler: noop(),
        }
    }

    #[test]
    fn tokenizer_splits_on_whitespace_and_respects_quotes() {
        assert_eq!(
            tokenize(r#"say "hello world" foo"#),
            vec!["say", "hello world", "foo"]
        );
        assert_eq!(tokenize("  mute   7  "), vec!["mute", "7"]);
        assert_eq!(tokenize(""), Vec::<String>::new());
    }

    #[test]
    fn tokenizer_unescapes_the_closing_quote() {
        assert_eq!(tokenize(r"greet 'O\'Brien'"), vec!["greet", "O'Brien"]);
        assert_eq!(tokenize(r#"say "a \" b""#), vec!["say", "a \" b"]);
        // A backslash not followed by the closing quote is literal.
        assert_eq!(tokenize(r"say 'a\b'"), vec!["say", r"a\b"]);
    }

    #[test]
    fn tokenizer_drops_empty_quoted_strings() {
        assert_eq!(tokenize("a '' b"), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_names_are_rejected_and_first_registration_survives() {
        let registry = CommandRegistry::new();
        let roles = RoleTable::new();
        registry
            .register(def(&["kick"]).with_description("first"), &roles)
            .unwrap();

        let result = registry.register(def(&["kick", "boot"]), &roles);
        assert!(matches!(result, Err(Error::DuplicateCommandName(name)) if name == "kick"));

        // The losing registration must not leave stray aliases behind.
        assert!(registry.get("boot").is_none());
        assert_eq!(registry.get("kick").unwrap().description(), Some("first"));
    }

    #[test]
    fn names_are_lowercased_and_validated() {
        let registry = CommandRegistry::new();
        let roles = RoleTable::new();
        registry.register(def(&["Mute", "M"]), &roles).unwrap();
        assert!(registry.get("mute").is_some());
        assert!(registry.get("M").is_some());

        assert!(matches!(
            registry.register(def(&[]), &roles),
            Err(Error::InvalidCommand(_))
        ));
        assert!(matches!(
            registry.register(def(&["has space"]), &roles),
            Err(Error::InvalidCommand(_))
        ));
        assert!(matches!(
            registry.register(def(&["x", "x"]), &roles),
            Err(Error::InvalidCommand(_))
        ));
    }

    #[test]
    fn bad_access_strings_fail_at_registration() {
        let registry = CommandRegistry::new();
        let roles = RoleTable::new();
        let result = registry.register(def(&["op"]).with_access(">=nobody"), &roles);
        assert!(matches!(result, Err(Error::BadAccessString { .. })));
    }

    #[test]
    fn info_lists_each_command_once() {
        let registry = CommandRegistry::new();
        let roles = RoleTable::new();
        registry
            .register(def(&["mute", "m"]).with_description("mute a player"), &roles)
            .unwrap();
        registry.register(def(&["kick"]), &roles).unwrap();

        let all = registry.info(None);
        assert_eq!(all.len(), 2);

        let one = registry.info(Some("M"));
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].names, vec!["mute", "m"]);
        assert_eq!(one[0].description.as_deref(), Some("mute a player"));
    }
}
