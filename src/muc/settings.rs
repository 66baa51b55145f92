//! Room configuration as a set of mutually exclusive type flags.
//!
//! Every room carries exactly one [`RoomType`] per [`ConfigAxis`]; turning
//! one flag on implicitly turns its opposite off because settings are
//! stored as one slot per axis.

use thiserror::Error;

/// The independent dimensions of room behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigAxis {
    Visibility,
    EntryPolicy,
    Lifetime,
    Moderation,
    Security,
    Anonymity,
    SubjectPolicy,
}

impl ConfigAxis {
    pub const COUNT: usize = 7;

    fn index(self) -> usize {
        match self {
            ConfigAxis::Visibility => 0,
            ConfigAxis::EntryPolicy => 1,
            ConfigAxis::Lifetime => 2,
            ConfigAxis::Moderation => 3,
            ConfigAxis::Security => 4,
            ConfigAxis::Anonymity => 5,
            ConfigAxis::SubjectPolicy => 6,
        }
    }
}

/// One behaviour flag. Each variant belongs to exactly one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomType {
    Public,
    Hidden,
    Open,
    MembersOnly,
    Temporary,
    Persistent,
    Unmoderated,
    Moderated,
    Unsecured,
    PasswordProtected,
    NonAnonymous,
    SemiAnonymous,
    FullyAnonymous,
    OpenSubject,
    ModeratedSubject,
}

impl RoomType {
    /// The axis this flag lives on.
    pub fn axis(self) -> ConfigAxis {
        match self {
            RoomType::Public | RoomType::Hidden => ConfigAxis::Visibility,
            RoomType::Open | RoomType::MembersOnly => ConfigAxis::EntryPolicy,
            RoomType::Temporary | RoomType::Persistent => ConfigAxis::Lifetime,
            RoomType::Unmoderated | RoomType::Moderated => ConfigAxis::Moderation,
            RoomType::Unsecured | RoomType::PasswordProtected => ConfigAxis::Security,
            RoomType::NonAnonymous | RoomType::SemiAnonymous | RoomType::FullyAnonymous => {
                ConfigAxis::Anonymity
            }
            RoomType::OpenSubject | RoomType::ModeratedSubject => ConfigAxis::SubjectPolicy,
        }
    }
}

/// Two flags on the same axis were requested together.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("conflicting room types {0:?} and {1:?} on the same configuration axis")]
pub struct SettingsConflict(pub RoomType, pub RoomType);

/// A complete room configuration: one flag per axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSettings {
    slots: [RoomType; ConfigAxis::COUNT],
}

impl RoomSettings {
    const DEFAULTS: [RoomType; ConfigAxis::COUNT] = [
        RoomType::Public,
        RoomType::Open,
        RoomType::Temporary,
        RoomType::Unmoderated,
        RoomType::Unsecured,
        RoomType::FullyAnonymous,
        RoomType::ModeratedSubject,
    ];

    /// Build settings from an explicit list of flags; unmentioned axes
    /// take their defaults. Naming two different flags on one axis is an
    /// error; repeating the same flag is not.
    pub fn new(types: &[RoomType]) -> Result<Self, SettingsConflict> {
        let mut slots = Self::DEFAULTS;
        let mut chosen: [Option<RoomType>; ConfigAxis::COUNT] = [None; ConfigAxis::COUNT];
        for &requested in types {
            let slot = requested.axis().index();
            if let Some(previous) = chosen[slot] {
                if previous != requested {
                    return Err(SettingsConflict(previous, requested));
                }
            }
            chosen[slot] = Some(requested);
            slots[slot] = requested;
        }
        Ok(Self { slots })
    }

    /// Whether this configuration carries the given flag.
    pub fn contains(&self, room_type: RoomType) -> bool {
        self.slots[room_type.axis().index()] == room_type
    }

    /// The active flag on an axis.
    pub fn get(&self, axis: ConfigAxis) -> RoomType {
        self.slots[axis.index()]
    }

    /// Set a flag, displacing whatever was on its axis.
    pub fn set(&mut self, room_type: RoomType) {
        self.slots[room_type.axis().index()] = room_type;
    }

    /// All active flags, one per axis.
    pub fn types(&self) -> [RoomType; ConfigAxis::COUNT] {
        self.slots
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            slots: Self::DEFAULTS,
        }
    }
}
