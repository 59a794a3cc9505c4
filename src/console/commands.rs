//! Console command table.

use super::AccessLevel;
use std::fmt;

/// Built-in console commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Help,
    Uptime,
    Who,
    Kick,
    Exit,
    Subscribe,
    Unsubscribe,
    List,
    Trigger,
}

/// Help entry of a built-in command.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinInfo {
    pub name: &'static str,
    pub command: Builtin,
    pub short: &'static str,
    pub long: &'static str,
    pub visible: bool,
    pub access: AccessLevel,
    /// Only offered when a bus is attached.
    pub needs_bus: bool,
}

/// Built-ins in `help` order.
pub const BUILTINS: &[BuiltinInfo] = &[
    BuiltinInfo {
        name: "help",
        command: Builtin::Help,
        short: "Displays a list of commands or help for a specific command.",
        long: "Usage: help [command]\r\nWithout a command lists everything you can use.",
        visible: true,
        access: AccessLevel::User,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "uptime",
        command: Builtin::Uptime,
        short: "Displays the current uptime of the system.",
        long: "Displays the time since the control runtime started.",
        visible: true,
        access: AccessLevel::User,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "who",
        command: Builtin::Who,
        short: "Displays a list of connected clients and their associated info.",
        long: "Usage: who",
        visible: true,
        access: AccessLevel::Admin,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "kick",
        command: Builtin::Kick,
        short: "Disconnect a client that is also connected to this console.",
        long: "Usage: kick <clientid>\r\nThe client ID is the number shown by the who command.",
        visible: true,
        access: AccessLevel::Admin,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "exit",
        command: Builtin::Exit,
        short: "Disconnect from system. Can also use quit or bye.",
        long: "Closes this console session.",
        visible: true,
        access: AccessLevel::User,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "quit",
        command: Builtin::Exit,
        short: "Disconnect from system.",
        long: "Closes this console session.",
        visible: false,
        access: AccessLevel::User,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "bye",
        command: Builtin::Exit,
        short: "Disconnect from system.",
        long: "Closes this console session.",
        visible: false,
        access: AccessLevel::User,
        needs_bus: false,
    },
    BuiltinInfo {
        name: "subscribe",
        command: Builtin::Subscribe,
        short: "Subscribe for feedback for a specific device or system event.",
        long: "Usage: subscribe <name> [name...]\r\nName can be a specific device, \"system\", or \"all\".",
        visible: true,
        access: AccessLevel::User,
        needs_bus: true,
    },
    BuiltinInfo {
        name: "unsubscribe",
        command: Builtin::Unsubscribe,
        short: "Stop feedback for a specific device or system event.",
        long: "Usage: unsubscribe <name> [name...]\r\nName can be a specific device, \"system\", or \"all\".",
        visible: true,
        access: AccessLevel::User,
        needs_bus: true,
    },
    BuiltinInfo {
        name: "list",
        command: Builtin::List,
        short: "List of devices and events registered with the event system.",
        long: "Usage: list\r\nThe names can be used with the subscribe command.",
        visible: true,
        access: AccessLevel::User,
        needs_bus: true,
    },
    BuiltinInfo {
        name: "trigger",
        command: Builtin::Trigger,
        short: "Trigger an event in the system manually.",
        long: "Usage: trigger <name> [data]\r\nThis requires specific knowledge of what has registered for events.",
        visible: true,
        access: AccessLevel::Admin,
        needs_bus: true,
    },
];

/// Look up a built-in by lowercase name.
#[must_use]
pub fn builtin(name: &str, with_bus: bool) -> Option<&'static BuiltinInfo> {
    BUILTINS
        .iter()
        .find(|entry| entry.name == name && (with_bus || !entry.needs_bus))
}

/// Handler of a custom command: receives the parameters after the command
/// name, in their original case, and returns the text to show.
pub type CommandHandler = Box<dyn Fn(&str) -> String + Send + Sync>;

/// A command registered by the application.
pub struct CustomCommand {
    pub(crate) name: String,
    pub(crate) short: String,
    pub(crate) long: String,
    pub(crate) access: AccessLevel,
    pub(crate) handler: CommandHandler,
}

impl CustomCommand {
    pub fn new<F>(name: &str, short: impl Into<String>, long: impl Into<String>, access: AccessLevel, handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.to_lowercase(),
            short: short.into(),
            long: long.into(),
            access,
            handler: Box::new(handler),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCommand")
            .field("name", &self.name)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

/// `Current uptime is: ...` text for a whole number of minutes.
#[must_use]
pub fn format_uptime(minutes: u64) -> String {
    if minutes < 60 {
        format!("Current uptime is: {minutes} minutes.")
    } else if minutes < 1440 {
        format!("Current uptime is: {} hours, {} minutes.", minutes / 60, minutes % 60)
    } else {
        format!(
            "Current uptime is: {} days, {} hours, {} minutes.",
            minutes / 1440,
            (minutes % 1440) / 60,
            minutes % 60
        )
    }
}
