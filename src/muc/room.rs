//! Rooms, occupants, members, affiliations and roles.
//!
//! A [`Room`] owns its occupant roster behind one mutex so that nickname
//! uniqueness checks and admission happen in a single critical section.
//! Member records (bare JID to affiliation) persist across visits;
//! occupants exist only while joined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use jid::{BareJid, FullJid};
use minidom::Element;
use thiserror::Error;
use tracing::debug;
use xmpp_parsers::presence::Presence;

use super::history::{DiscussionHistory, DEFAULT_HISTORY_CAPACITY};
use super::settings::{RoomSettings, RoomType};
use super::NS_MUC;

/// Long-lived association between a bare JID and a room, ranked.
///
/// Ordering follows privilege: owner outranks admin outranks member
/// outranks none outranks outcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Affiliation {
    Outcast,
    None,
    Member,
    Admin,
    Owner,
}

impl Affiliation {
    pub fn outranks(self, other: Affiliation) -> bool {
        self > other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Affiliation::Outcast => "outcast",
            Affiliation::None => "none",
            Affiliation::Member => "member",
            Affiliation::Admin => "admin",
            Affiliation::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Affiliation> {
        match s {
            "outcast" => Some(Affiliation::Outcast),
            "none" => Some(Affiliation::None),
            "member" => Some(Affiliation::Member),
            "admin" => Some(Affiliation::Admin),
            "owner" => Some(Affiliation::Owner),
            _ => None,
        }
    }
}

/// Short-lived position of an occupant within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    None,
    Visitor,
    Participant,
    Moderator,
}

impl Role {
    /// Default role granted on entry, derived from affiliation and the
    /// room's moderation flag.
    pub fn on_entry(affiliation: Affiliation, settings: &RoomSettings) -> Role {
        match affiliation {
            Affiliation::Owner | Affiliation::Admin => Role::Moderator,
            Affiliation::Member => Role::Participant,
            Affiliation::None | Affiliation::Outcast => {
                if settings.contains(RoomType::Moderated) {
                    Role::Visitor
                } else {
                    Role::Participant
                }
            }
        }
    }

    pub fn has_voice(self) -> bool {
        matches!(self, Role::Participant | Role::Moderator)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Visitor => "visitor",
            Role::Participant => "participant",
            Role::Moderator => "moderator",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "none" => Some(Role::None),
            "visitor" => Some(Role::Visitor),
            "participant" => Some(Role::Participant),
            "moderator" => Some(Role::Moderator),
            _ => None,
        }
    }
}

/// Persistent membership record.
#[derive(Debug, Clone)]
pub struct Member {
    pub jid: BareJid,
    pub affiliation: Affiliation,
    /// Reserved nickname enforced on join, if any.
    pub nick: Option<String>,
}

/// A user currently present in a room.
#[derive(Debug)]
pub struct Occupant {
    jid: FullJid,
    nick: RwLock<String>,
    role: RwLock<Role>,
    affiliation: RwLock<Affiliation>,
    // Non-protocol presence payloads from the last presence, re-broadcast
    // on later updates.
    extras: Mutex<Vec<Element>>,
}

impl Occupant {
    fn new(jid: FullJid, nick: String, affiliation: Affiliation, role: Role) -> Self {
        Self {
            jid,
            nick: RwLock::new(nick),
            role: RwLock::new(role),
            affiliation: RwLock::new(affiliation),
            extras: Mutex::new(Vec::new()),
        }
    }

    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    pub fn nick(&self) -> String {
        self.nick.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn set_nick(&self, nick: &str) {
        if let Ok(mut current) = self.nick.write() {
            *current = nick.to_string();
        }
    }

    pub fn role(&self) -> Role {
        self.role.read().map(|r| *r).unwrap_or(Role::None)
    }

    pub fn set_role(&self, role: Role) {
        if let Ok(mut current) = self.role.write() {
            *current = role;
        }
    }

    pub fn affiliation(&self) -> Affiliation {
        self.affiliation.read().map(|a| *a).unwrap_or(Affiliation::None)
    }

    pub fn set_affiliation(&self, affiliation: Affiliation) {
        if let Ok(mut current) = self.affiliation.write() {
            *current = affiliation;
        }
    }

    pub fn is_moderator(&self) -> bool {
        self.role() == Role::Moderator
    }

    /// Capture every payload of a presence that is not chat-protocol
    /// machinery, for replay on subsequent broadcasts.
    pub fn capture_extras(&self, presence: &Presence) {
        if let Ok(mut extras) = self.extras.lock() {
            *extras = presence
                .payloads
                .iter()
                .filter(|p| !p.ns().starts_with(NS_MUC))
                .cloned()
                .collect();
        }
    }

    pub fn extras(&self) -> Vec<Element> {
        self.extras.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// Why an admission request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("nickname already in use")]
    NickTaken,
    #[error("user is banned from the room")]
    Banned,
    #[error("room is members-only")]
    NotAMember,
    #[error("room is full")]
    Full,
    #[error("room is locked")]
    Locked,
}

/// A chat room.
pub struct Room {
    jid: BareJid,
    name: RwLock<String>,
    settings: RwLock<RoomSettings>,
    password: RwLock<Option<String>>,
    subject: RwLock<Option<String>>,
    max_occupants: RwLock<Option<usize>>,
    locked: AtomicBool,
    occupants: Mutex<HashMap<FullJid, Arc<Occupant>>>,
    members: Mutex<HashMap<BareJid, Member>>,
    history: Mutex<DiscussionHistory>,
}

impl Room {
    pub fn new(jid: BareJid, name: impl Into<String>, settings: RoomSettings) -> Self {
        Self {
            jid,
            name: RwLock::new(name.into()),
            settings: RwLock::new(settings),
            password: RwLock::new(None),
            subject: RwLock::new(None),
            max_occupants: RwLock::new(None),
            locked: AtomicBool::new(false),
            occupants: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            history: Mutex::new(DiscussionHistory::new(DEFAULT_HISTORY_CAPACITY)),
        }
    }

    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    pub fn name(&self) -> String {
        self.name.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        if let Ok(mut current) = self.name.write() {
            *current = name.into();
        }
    }

    pub fn settings(&self) -> RoomSettings {
        self.settings.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_type(&self, room_type: RoomType) -> bool {
        self.settings().contains(room_type)
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut RoomSettings)) {
        if let Ok(mut settings) = self.settings.write() {
            f(&mut settings);
        }
    }

    pub fn password(&self) -> Option<String> {
        self.password.read().ok().and_then(|p| p.clone())
    }

    pub fn set_password(&self, password: Option<String>) {
        if let Ok(mut current) = self.password.write() {
            *current = password;
        }
    }

    pub fn subject(&self) -> Option<String> {
        self.subject.read().ok().and_then(|s| s.clone())
    }

    pub fn set_subject(&self, subject: Option<String>) {
        if let Ok(mut current) = self.subject.write() {
            *current = subject;
        }
    }

    pub fn max_occupants(&self) -> Option<usize> {
        self.max_occupants.read().ok().and_then(|m| *m)
    }

    pub fn set_max_occupants(&self, max: Option<usize>) {
        if let Ok(mut current) = self.max_occupants.write() {
            *current = max;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    /// Run `f` with the room's history under its lock.
    pub fn with_history<T>(&self, f: impl FnOnce(&mut DiscussionHistory) -> T) -> Option<T> {
        self.history.lock().ok().map(|mut h| f(&mut h))
    }

    /// Affiliation of a bare JID, member record or not.
    pub fn affiliation_of(&self, jid: &BareJid) -> Affiliation {
        self.members
            .lock()
            .ok()
            .and_then(|members| members.get(jid).map(|m| m.affiliation))
            .unwrap_or(Affiliation::None)
    }

    pub fn member(&self, jid: &BareJid) -> Option<Member> {
        self.members.lock().ok().and_then(|m| m.get(jid).cloned())
    }

    pub fn members(&self) -> Vec<Member> {
        self.members
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Record or update an affiliation. `Affiliation::None` removes the
    /// record.
    pub fn set_affiliation(&self, jid: &BareJid, affiliation: Affiliation) {
        let Ok(mut members) = self.members.lock() else {
            return;
        };
        if affiliation == Affiliation::None {
            members.remove(jid);
        } else {
            members
                .entry(jid.clone())
                .and_modify(|m| m.affiliation = affiliation)
                .or_insert_with(|| Member {
                    jid: jid.clone(),
                    affiliation,
                    nick: None,
                });
        }
        if let Some(occupant) = self.occupant_by_bare(jid) {
            occupant.set_affiliation(affiliation);
        }
    }

    /// Admit a user under the requested nickname.
    ///
    /// All checks and the roster insert happen under the occupant lock so
    /// two concurrent joins cannot claim the same nickname or both squeeze
    /// past the occupancy limit.
    pub fn add_occupant(
        &self,
        jid: &FullJid,
        requested_nick: &str,
    ) -> Result<Arc<Occupant>, AdmissionError> {
        let affiliation = self.affiliation_of(&jid.to_bare());
        let settings = self.settings();
        let reserved_nick = self.member(&jid.to_bare()).and_then(|m| m.nick);

        let Ok(mut occupants) = self.occupants.lock() else {
            return Err(AdmissionError::Locked);
        };

        // A member's reserved nickname overrides the requested one.
        let nick = reserved_nick.as_deref().unwrap_or(requested_nick);

        if occupants
            .values()
            .any(|o| o.jid() != jid && o.nick() == nick)
        {
            return Err(AdmissionError::NickTaken);
        }
        if affiliation == Affiliation::Outcast {
            return Err(AdmissionError::Banned);
        }
        if settings.contains(RoomType::MembersOnly) && affiliation < Affiliation::Member {
            return Err(AdmissionError::NotAMember);
        }
        if self.is_locked() && affiliation != Affiliation::Owner {
            return Err(AdmissionError::Locked);
        }
        if let Some(max) = self.max_occupants() {
            if occupants.len() >= max {
                return Err(AdmissionError::Full);
            }
        }

        let role = Role::on_entry(affiliation, &settings);
        let occupant = Arc::new(Occupant::new(jid.clone(), nick.to_string(), affiliation, role));
        occupants.insert(jid.clone(), occupant.clone());
        debug!(room = %self.jid, occupant = %jid, nick, "occupant admitted");
        Ok(occupant)
    }

    pub fn remove_occupant(&self, jid: &FullJid) -> Option<Arc<Occupant>> {
        let removed = self.occupants.lock().ok()?.remove(jid);
        if let Some(occupant) = &removed {
            occupant.set_role(Role::None);
            debug!(room = %self.jid, occupant = %jid, "occupant removed");
        }
        removed
    }

    pub fn occupant_by_jid(&self, jid: &FullJid) -> Option<Arc<Occupant>> {
        self.occupants.lock().ok()?.get(jid).cloned()
    }

    /// Any occupant whose full JID matches the bare JID.
    pub fn occupant_by_bare(&self, jid: &BareJid) -> Option<Arc<Occupant>> {
        self.occupants
            .lock()
            .ok()?
            .values()
            .find(|o| &o.jid().to_bare() == jid)
            .cloned()
    }

    pub fn occupant_by_nick(&self, nick: &str) -> Option<Arc<Occupant>> {
        self.occupants
            .lock()
            .ok()?
            .values()
            .find(|o| o.nick() == nick)
            .cloned()
    }

    pub fn occupants(&self) -> Vec<Arc<Occupant>> {
        self.occupants
            .lock()
            .map(|o| o.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.occupant_count() == 0
    }

    /// Whether a nickname is claimed by anyone other than `except`.
    pub fn nick_taken(&self, nick: &str, except: Option<&FullJid>) -> bool {
        self.occupants
            .lock()
            .map(|occupants| {
                occupants
                    .values()
                    .any(|o| Some(o.jid()) != except && o.nick() == nick)
            })
            .unwrap_or(false)
    }
}
