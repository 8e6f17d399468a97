//! Camera command metadata: value types, priorities and the resolution table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dispatch priority of a camera command. Lower values are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    /// Reboot and emergency actions.
    Critical = 0,
    /// Resolution, frame rate, mode.
    High = 1,
    /// Stats requests and minor adjustments.
    Normal = 2,
    Low = 3,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Priority::Critical),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::Low),
            other => Err(format!("invalid priority {other} (expected 0-3)")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

/// Declared value type of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ValueKind {
    /// Integer argument within an inclusive range.
    Int { min: i64, max: i64 },
    /// No meaningful argument.
    Trigger,
}

/// Metadata for a single camera command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(flatten)]
    pub kind: ValueKind,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl CommandSpec {
    fn int(min: i64, max: i64, priority: Priority, description: &str) -> Self {
        Self {
            kind: ValueKind::Int { min, max },
            priority,
            description: description.into(),
        }
    }

    fn trigger(priority: Priority, description: &str) -> Self {
        Self {
            kind: ValueKind::Trigger,
            priority,
            description: description.into(),
        }
    }
}

/// Errors reported by [`CommandTable::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("value for {cmd} is not an integer: {val:?}")]
    NotAnInteger { cmd: String, val: String },

    #[error("value {val} for {cmd} out of range [{min}, {max}]")]
    OutOfRange {
        cmd: String,
        val: i64,
        min: i64,
        max: i64,
    },
}

/// Lookup table of known commands, keyed by lower-case name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTable {
    commands: BTreeMap<String, CommandSpec>,
}

impl Default for CommandTable {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        let mut add = |name: &str, spec: CommandSpec| {
            commands.insert(name.to_string(), spec);
        };

        add("resolution", CommandSpec::int(0, 12, Priority::High, "Change resolution"));
        add(
            "quality",
            CommandSpec::int(10, 63, Priority::High, "JPEG quality (10=best, 63=worst)"),
        );
        add("fps", CommandSpec::int(1, 30, Priority::High, "Frames per second"));
        add("mode", CommandSpec::int(0, 1, Priority::High, "0=speed, 1=stability"));
        add("reboot", CommandSpec::trigger(Priority::Critical, "Reboot the camera"));
        add("stats", CommandSpec::trigger(Priority::Normal, "Request statistics"));
        add("flash", CommandSpec::int(0, 255, Priority::Normal, "Flash LED intensity"));
        add("brightness", CommandSpec::int(-2, 2, Priority::Normal, "Brightness"));
        add("contrast", CommandSpec::int(-2, 2, Priority::Normal, "Contrast"));
        add("saturation", CommandSpec::int(-2, 2, Priority::Normal, "Saturation"));

        Self { commands }
    }
}

impl CommandTable {
    /// Returns the default table extended (or overridden) by `overrides`.
    pub fn with_overrides(overrides: BTreeMap<String, CommandSpec>) -> Self {
        let mut table = Self::default();
        for (name, spec) in overrides {
            table.commands.insert(name.to_lowercase(), spec);
        }
        table
    }

    /// Returns the spec for `cmd`, if known.
    pub fn get(&self, cmd: &str) -> Option<&CommandSpec> {
        self.commands.get(cmd)
    }

    /// Returns the dispatch priority for `cmd`; unknown commands are
    /// [`Priority::Normal`].
    pub fn priority_of(&self, cmd: &str) -> Priority {
        self.get(cmd).map_or(Priority::Normal, |s| s.priority)
    }

    /// Checks `val` against the declared value type of `cmd`.
    ///
    /// Intended for request-facing collaborators; the relay core only
    /// performs priority lookup.
    pub fn validate(&self, cmd: &str, val: &str) -> Result<(), CommandError> {
        let spec = self
            .get(cmd)
            .ok_or_else(|| CommandError::Unknown(cmd.to_string()))?;

        match spec.kind {
            ValueKind::Trigger => Ok(()),
            ValueKind::Int { min, max } => {
                let v: i64 = val.trim().parse().map_err(|_| CommandError::NotAnInteger {
                    cmd: cmd.to_string(),
                    val: val.to_string(),
                })?;
                if v < min || v > max {
                    return Err(CommandError::OutOfRange {
                        cmd: cmd.to_string(),
                        val: v,
                        min,
                        max,
                    });
                }
                Ok(())
            }
        }
    }

    /// Iterates over all known commands in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CommandSpec)> {
        self.commands.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Frame sizes supported by the camera sensor, indexed by the
/// `resolution` command value.
pub const RESOLUTIONS: [(u8, &str); 13] = [
    (0, "QQVGA (160x120)"),
    (1, "QCIF (176x144)"),
    (2, "HQVGA (240x176)"),
    (3, "QVGA (320x240)"),
    (4, "CIF (400x296)"),
    (5, "VGA (640x480)"),
    (6, "SVGA (800x600)"),
    (7, "XGA (1024x768)"),
    (8, "HD (1280x720)"),
    (9, "SXGA (1280x1024)"),
    (10, "UXGA (1600x1200)"),
    (11, "FHD (1920x1080)"),
    (12, "QXGA (2048x1536)"),
];

/// Resolution index used when the camera has not been told otherwise (VGA).
pub const DEFAULT_RESOLUTION: u8 = 5;

/// Returns the label for a resolution index.
pub fn resolution_label(index: u8) -> Option<&'static str> {
    RESOLUTIONS
        .iter()
        .find(|(i, _)| *i == index)
        .map(|(_, label)| *label)
}
