//! The events directory: canonical event bodies and their secondary indices.
//!
//! This directory exclusively owns every index below; other components read
//! through its typed operations and never build its keys themselves.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId};
use tracing::trace;

use crate::{
    authz::RoomAuthorizer,
    error::{Result, RoomservError},
    keys::{
        self, versionstamp_value, Element, Subspace, Versionstamp, VERSIONSTAMP_VALUE_OFFSET,
    },
    store::{RangeOptions, TxnRead, WriteTxn},
    types::{
        sort_events, Event, Membership, StateMap, StateTup, EVENT_TYPE_CREATE,
        EVENT_TYPE_JOIN_RULES, EVENT_TYPE_MEMBER, EVENT_TYPE_POWER_LEVELS, REL_TYPE_ANNOTATION,
        REL_TYPE_THREAD,
    },
};

/// Soft cap on events walked by one auth-chain transaction, keeping a single
/// transaction inside the store deadline.
pub const AUTH_CHAIN_SOFT_CAP: usize = 5_000;

const AUTH_STATE_TYPES: [&str; 3] = [
    EVENT_TYPE_CREATE,
    EVENT_TYPE_POWER_LEVELS,
    EVENT_TYPE_JOIN_RULES,
];

pub struct EventsDirectory {
    by_id: Subspace,
    by_version: Subspace,
    id_to_version: Subspace,

    by_room_version: Subspace,
    by_room_state_version: Subspace,
    by_room_extrem: Subspace,

    by_room_version_state_tup: Subspace,

    by_room_current_state_tup: Subspace,
    by_room_current_members: Subspace,
    by_room_current_servers: Subspace,

    by_room_relation: Subspace,
    by_room_reaction: Subspace,
    by_room_thread: Subspace,
}

/// Side-effects of a persisted event the orchestrating write path has to
/// mirror into the membership projections.
#[derive(Debug)]
pub struct PersistOutcome {
    pub state_won: bool,
    pub membership: Option<MembershipUpdate>,
}

#[derive(Debug)]
pub struct MembershipUpdate {
    pub user_id: OwnedUserId,
    pub membership: Membership,
    pub prev_membership: Option<Membership>,
}

impl EventsDirectory {
    pub fn new(parent: &Subspace) -> Self {
        let dir = parent.sub("events");
        trace!(prefix = ?dir.prefix(), "Init rooms/events directory");

        // Subspace prefixes are intentionally short; they are part of the
        // persisted layout and must stay stable.
        Self {
            by_id: dir.sub("id"),
            by_version: dir.sub("ver"),
            id_to_version: dir.sub("itv"),

            by_room_version: dir.sub("rmv"),
            by_room_state_version: dir.sub("rsv"),
            by_room_extrem: dir.sub("rex"),

            by_room_version_state_tup: dir.sub("rvs"),

            by_room_current_state_tup: dir.sub("rcs"),
            by_room_current_members: dir.sub("rmb"),
            by_room_current_servers: dir.sub("rsr"),

            by_room_relation: dir.sub("rel"),
            by_room_reaction: dir.sub("rea"),
            by_room_thread: dir.sub("rth"),
        }
    }

    // Key builders
    //

    fn key_for_event(&self, event_id: &OwnedEventId) -> Vec<u8> {
        self.by_id.pack(&[event_id.as_str().into()])
    }

    fn key_for_id_to_version(&self, event_id: &OwnedEventId) -> Vec<u8> {
        self.id_to_version.pack(&[event_id.as_str().into()])
    }

    fn key_for_current_state_tup(&self, room_id: &OwnedRoomId, tup: &StateTup) -> Vec<u8> {
        self.by_room_current_state_tup.pack(&[
            room_id.as_str().into(),
            tup.kind.as_str().into(),
            tup.state_key.as_str().into(),
        ])
    }

    fn key_for_current_member(&self, room_id: &OwnedRoomId, user_id: &str) -> Vec<u8> {
        self.by_room_current_members
            .pack(&[room_id.as_str().into(), user_id.into()])
    }

    fn key_for_current_server(&self, room_id: &OwnedRoomId, server: &OwnedServerName) -> Vec<u8> {
        self.by_room_current_servers
            .pack(&[room_id.as_str().into(), server.as_str().into()])
    }

    fn key_for_extrem(&self, room_id: &OwnedRoomId, event_id: &OwnedEventId) -> Vec<u8> {
        self.by_room_extrem
            .pack(&[room_id.as_str().into(), event_id.as_str().into()])
    }

    // Point lookups
    //

    pub fn txn_get_event(&self, txn: &impl TxnRead, event_id: &OwnedEventId) -> Result<Option<Event>> {
        match txn.get(&self.key_for_event(event_id))? {
            Some(raw) => Ok(Some(Event::from_bytes(&raw, event_id.clone())?)),
            None => Ok(None),
        }
    }

    pub fn txn_event_version(
        &self,
        txn: &impl TxnRead,
        event_id: &OwnedEventId,
    ) -> Result<Option<Versionstamp>> {
        match txn.get(&self.key_for_id_to_version(event_id))? {
            Some(raw) => Ok(Some(keys::value_to_versionstamp(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn txn_event_exists(&self, txn: &impl TxnRead, event_id: &OwnedEventId) -> Result<bool> {
        Ok(txn.get(&self.key_for_id_to_version(event_id))?.is_some())
    }

    // Ingest
    //

    /// Persist one event and all its indices. Preconditions are checked
    /// before any write so a rejection leaves the transaction untouched.
    /// Membership mirroring into the per-user/per-server projections is
    /// reported back through the outcome.
    pub fn txn_persist_event(
        &self,
        txn: &WriteTxn<'_>,
        ev: &Event,
        user_version: u16,
        provider: &TxnEventsProvider<'_, WriteTxn<'_>>,
        authorizer: &dyn RoomAuthorizer,
    ) -> Result<PersistOutcome> {
        if self.txn_event_exists(txn, &ev.id)? {
            return Err(RoomservError::AlreadyExists);
        }

        // Resolve declared auth events; an event whose auth graph we do not
        // have cannot be checked and is rejected outright.
        for auth_id in &ev.auth_events {
            provider.will_get(auth_id);
        }
        let mut auth_events = Vec::with_capacity(ev.auth_events.len());
        for auth_id in &ev.auth_events {
            match provider.get(auth_id) {
                Ok(auth_ev) => auth_events.push(auth_ev),
                Err(RoomservError::EventNotFound) => {
                    return Err(RoomservError::AuthRejected(format!(
                        "unknown auth event {auth_id}"
                    )));
                }
                Err(err) => return Err(err),
            }
        }

        // The auth graph is a DAG: an event must not transitively auth
        // itself.
        let chain = self.txn_auth_chain_for_events(&auth_events, provider, AUTH_CHAIN_SOFT_CAP)?;
        if ev.auth_events.contains(&ev.id) || chain.iter().any(|e| e.id == ev.id) {
            return Err(RoomservError::AuthRejected(
                "event appears in its own auth chain".into(),
            ));
        }

        let state_before = self.txn_auth_state_before(txn, ev)?;
        authorizer
            .authorise(ev, &auth_events, &state_before)
            .map_err(RoomservError::AuthRejected)?;

        // Reaction dedup is a precondition too: a duplicate must leave no
        // stream or state side-effects.
        let relation = ev.relation();
        let mut reaction_key = None;
        if let Some((parent, rel_type, key)) = &relation {
            if rel_type == REL_TYPE_ANNOTATION {
                let key = key.clone().unwrap_or_default();
                let packed = self.by_room_reaction.pack(&[
                    ev.room_id.as_str().into(),
                    parent.as_str().into(),
                    ev.sender.as_str().into(),
                    key.as_str().into(),
                ]);
                if txn.get(&packed)?.is_some() {
                    return Err(RoomservError::DuplicateReaction);
                }
                reaction_key = Some(packed);
            }
        }

        let version = Versionstamp::incomplete(user_version);

        // 1. Core indices.
        txn.set(self.key_for_event(&ev.id), ev.to_bytes()?);
        txn.set_versionstamped_value(
            self.key_for_id_to_version(&ev.id),
            versionstamp_value(version),
            VERSIONSTAMP_VALUE_OFFSET,
        )?;
        let (key, offset) = self
            .by_version
            .pack_with_versionstamp(&[Element::Version(version)])?;
        txn.set_versionstamped_key(key, offset, ev.id.as_str().as_bytes().to_vec())?;
        let (key, offset) = self
            .by_room_version
            .pack_with_versionstamp(&[ev.room_id.as_str().into(), Element::Version(version)])?;
        txn.set_versionstamped_key(key, offset, ev.id.as_str().as_bytes().to_vec())?;

        // 2. State history and the current-state projection.
        let mut outcome = PersistOutcome {
            state_won: false,
            membership: None,
        };
        if let Some(tup) = ev.state_tup() {
            let (key, offset) = self.by_room_state_version.pack_with_versionstamp(&[
                ev.room_id.as_str().into(),
                Element::Version(version),
            ])?;
            txn.set_versionstamped_key(
                key,
                offset,
                keys::pack(&[
                    ev.id.as_str().into(),
                    tup.kind.as_str().into(),
                    tup.state_key.as_str().into(),
                ]),
            )?;

            let (key, offset) = self.by_room_version_state_tup.pack_with_versionstamp(&[
                ev.room_id.as_str().into(),
                tup.kind.as_str().into(),
                tup.state_key.as_str().into(),
                Element::Version(version),
            ])?;
            txn.set_versionstamped_key(key, offset, ev.id.as_str().as_bytes().to_vec())?;

            if self.txn_state_wins(txn, ev, &tup, version)? {
                outcome.state_won = true;
                txn.set(
                    self.key_for_current_state_tup(&ev.room_id, &tup),
                    ev.id.as_str().as_bytes().to_vec(),
                );

                if ev.kind == EVENT_TYPE_MEMBER {
                    let membership = ev.membership().ok_or_else(|| {
                        RoomservError::AuthRejected("member event without membership".into())
                    })?;
                    let user_id = OwnedUserId::try_from(tup.state_key.as_str()).map_err(|_| {
                        RoomservError::AuthRejected("member event with invalid state key".into())
                    })?;

                    let member_key = self.key_for_current_member(&ev.room_id, &tup.state_key);
                    let prev_membership = match txn.get(&member_key)? {
                        Some(raw) => Some(parse_membership_value(&raw)?.1),
                        None => None,
                    };
                    txn.set(member_key, membership_value(&ev.id, membership));

                    outcome.membership = Some(MembershipUpdate {
                        user_id,
                        membership,
                        prev_membership,
                    });
                }
            }
        }

        // 3. Forward extremities: this event supersedes whatever it points
        // at.
        for prev in &ev.prev_events {
            txn.clear(self.key_for_extrem(&ev.room_id, prev));
        }
        txn.set(self.key_for_extrem(&ev.room_id, &ev.id), Vec::new());

        // 4. Relation indices.
        if let Some((parent, rel_type, _)) = &relation {
            let (key, offset) = self.by_room_relation.pack_with_versionstamp(&[
                ev.room_id.as_str().into(),
                parent.as_str().into(),
                Element::Version(version),
            ])?;
            txn.set_versionstamped_key(key, offset, ev.id.as_str().as_bytes().to_vec())?;

            if let Some(packed) = reaction_key {
                txn.set(packed, ev.id.as_str().as_bytes().to_vec());
            }
            if rel_type == REL_TYPE_THREAD {
                let (key, offset) = self.by_room_thread.pack_with_versionstamp(&[
                    ev.room_id.as_str().into(),
                    Element::Version(version),
                ])?;
                txn.set_versionstamped_key(key, offset, parent.as_str().as_bytes().to_vec())?;
            }
        }

        Ok(outcome)
    }

    /// Whether this event takes the current-state slot. Higher versionstamp
    /// wins; an equal version falls back to the deterministic
    /// (type, state_key, event_id) order.
    fn txn_state_wins(
        &self,
        txn: &WriteTxn<'_>,
        ev: &Event,
        tup: &StateTup,
        version: Versionstamp,
    ) -> Result<bool> {
        let current_key = self.key_for_current_state_tup(&ev.room_id, tup);
        let Some(raw) = txn.get(&current_key)? else {
            return Ok(true);
        };
        let current_id = event_id_from_bytes(&raw)?;
        let current_version = self
            .txn_event_version(txn, &current_id)?
            .unwrap_or(keys::ZERO_VERSIONSTAMP);
        if version != current_version {
            return Ok(version > current_version);
        }
        Ok(ev.id.as_str() > current_id.as_str())
    }

    /// The auth-relevant state currently in effect, fed to the authoriser:
    /// create/power-levels/join-rules plus the sender's (and, for member
    /// events, the target's) membership.
    fn txn_auth_state_before(&self, txn: &impl TxnRead, ev: &Event) -> Result<StateMap> {
        let mut state = StateMap::new();
        for kind in AUTH_STATE_TYPES {
            let tup = StateTup {
                kind: kind.to_owned(),
                state_key: String::new(),
            };
            if let Some(raw) = txn.get(&self.key_for_current_state_tup(&ev.room_id, &tup))? {
                state.insert(tup, event_id_from_bytes(&raw)?);
            }
        }

        let mut member_keys = vec![ev.sender.as_str().to_owned()];
        if ev.kind == EVENT_TYPE_MEMBER {
            if let Some(target) = &ev.state_key {
                if target != ev.sender.as_str() {
                    member_keys.push(target.clone());
                }
            }
        }
        for member in member_keys {
            let tup = StateTup {
                kind: EVENT_TYPE_MEMBER.to_owned(),
                state_key: member,
            };
            if let Some(raw) = txn.get(&self.key_for_current_state_tup(&ev.room_id, &tup))? {
                state.insert(tup, event_id_from_bytes(&raw)?);
            }
        }
        Ok(state)
    }

    // Auth chains
    //

    /// BFS over the `event -> auth_events` edges, deduplicated by id.
    /// Terminates when the frontier is empty or the soft cap is reached.
    /// Output is sorted by (depth, event_id) for a reproducible order.
    pub fn txn_auth_chain_for_events<T: TxnRead>(
        &self,
        events: &[Event],
        provider: &TxnEventsProvider<'_, T>,
        soft_cap: usize,
    ) -> Result<Vec<Event>> {
        let mut seen: HashSet<OwnedEventId> = events.iter().map(|ev| ev.id.clone()).collect();
        let mut frontier: VecDeque<OwnedEventId> = VecDeque::new();
        for ev in events {
            for auth_id in &ev.auth_events {
                if seen.insert(auth_id.clone()) {
                    provider.will_get(auth_id);
                    frontier.push_back(auth_id.clone());
                }
            }
        }

        let mut chain = Vec::new();
        while let Some(event_id) = frontier.pop_front() {
            if chain.len() >= soft_cap {
                break;
            }
            let ev = provider.get(&event_id)?;
            for auth_id in &ev.auth_events {
                if seen.insert(auth_id.clone()) {
                    provider.will_get(auth_id);
                    frontier.push_back(auth_id.clone());
                }
            }
            chain.push(ev);
        }

        sort_events(&mut chain);
        Ok(chain)
    }

    // State lookups
    //

    /// State in effect at (and including) the given event: the greatest
    /// version per (type, state_key) slot at or below the event's version.
    /// The filter narrows the scanned key ranges themselves, so restricted
    /// variants never walk a large room's full state history.
    pub fn txn_room_state_ids_at_event(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
        event_id: &OwnedEventId,
        filter: StateFilter<'_>,
    ) -> Result<StateMap> {
        let at_version = self
            .txn_event_version(txn, event_id)?
            .ok_or(RoomservError::EventNotFound)?;

        let mut state = StateMap::new();
        for (begin, end) in self.state_history_ranges(room_id, filter) {
            let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;
            for (key, value) in kvs {
                let elems = self.by_room_version_state_tup.unpack(&key)?;
                if elems.len() != 4 {
                    return Err(RoomservError::Fatal("malformed state version key".into()));
                }
                let version = keys::element_version(&elems[3])?;
                if version > at_version {
                    continue;
                }
                let tup = StateTup {
                    kind: keys::element_str(&elems[1])?.to_owned(),
                    state_key: keys::element_str(&elems[2])?.to_owned(),
                };
                // Keys arrive in slot-then-version order, so the last entry
                // per slot below the bound is the greatest.
                state.insert(tup, event_id_from_bytes(&value)?);
            }
        }
        Ok(state)
    }

    /// The key ranges of `by_room_version_state_tup` a filter has to visit:
    /// the whole room, one range per auth-set type, or one per member slot.
    fn state_history_ranges(
        &self,
        room_id: &OwnedRoomId,
        filter: StateFilter<'_>,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let room = room_id.as_str();
        match filter {
            StateFilter::All => vec![self.by_room_version_state_tup.range_of(&[room.into()])],
            StateFilter::AuthSet => AUTH_STATE_TYPES
                .iter()
                .chain(std::iter::once(&EVENT_TYPE_MEMBER))
                .map(|kind| {
                    self.by_room_version_state_tup
                        .range_of(&[room.into(), (*kind).into()])
                })
                .collect(),
            StateFilter::Members(users) => users
                .iter()
                .map(|user| {
                    self.by_room_version_state_tup.range_of(&[
                        room.into(),
                        EVENT_TYPE_MEMBER.into(),
                        user.as_str().into(),
                    ])
                })
                .collect(),
        }
    }

    /// Current full state map, member slots excluded (those live in the
    /// member mirror).
    pub fn txn_current_room_state_map(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
    ) -> Result<StateMap> {
        let (begin, end) = self.by_room_current_state_tup.range_of(&[room_id.as_str().into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;
        let mut state = StateMap::new();
        for (key, value) in kvs {
            let elems = self.by_room_current_state_tup.unpack(&key)?;
            if elems.len() != 3 {
                return Err(RoomservError::Fatal("malformed current state key".into()));
            }
            let tup = StateTup {
                kind: keys::element_str(&elems[1])?.to_owned(),
                state_key: keys::element_str(&elems[2])?.to_owned(),
            };
            if tup.kind == EVENT_TYPE_MEMBER {
                continue;
            }
            state.insert(tup, event_id_from_bytes(&value)?);
        }
        Ok(state)
    }

    /// Current membership mirror: user -> (event id, membership).
    pub fn txn_current_room_members(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
    ) -> Result<HashMap<OwnedUserId, (OwnedEventId, Membership)>> {
        let (begin, end) = self.by_room_current_members.range_of(&[room_id.as_str().into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;
        let mut members = HashMap::with_capacity(kvs.len());
        for (key, value) in kvs {
            let elems = self.by_room_current_members.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed member key".into()));
            }
            let user_id = OwnedUserId::try_from(keys::element_str(&elems[1])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed member id: {err}")))?;
            members.insert(user_id, parse_membership_value(&value)?);
        }
        Ok(members)
    }

    pub fn txn_current_room_member_state_map(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
    ) -> Result<StateMap> {
        let members = self.txn_current_room_members(txn, room_id)?;
        Ok(members
            .into_iter()
            .map(|(user_id, (event_id, _))| (StateTup::member(&user_id), event_id))
            .collect())
    }

    // Server mirror
    //

    pub fn txn_set_current_room_server(
        &self,
        txn: &WriteTxn<'_>,
        room_id: &OwnedRoomId,
        server: &OwnedServerName,
        event_id: &OwnedEventId,
    ) {
        txn.set(
            self.key_for_current_server(room_id, server),
            membership_value(event_id, Membership::Join),
        );
    }

    pub fn txn_clear_current_room_server(
        &self,
        txn: &WriteTxn<'_>,
        room_id: &OwnedRoomId,
        server: &OwnedServerName,
    ) {
        txn.clear(self.key_for_current_server(room_id, server));
    }

    pub fn txn_current_room_servers(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
    ) -> Result<Vec<OwnedServerName>> {
        let (begin, end) = self.by_room_current_servers.range_of(&[room_id.as_str().into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;
        let mut servers = Vec::with_capacity(kvs.len());
        for (key, _) in kvs {
            let elems = self.by_room_current_servers.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed server key".into()));
            }
            let server = OwnedServerName::try_from(keys::element_str(&elems[1])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed server name: {err}")))?;
            servers.push(server);
        }
        Ok(servers)
    }

    // Extremities
    //

    pub fn txn_current_room_extrem_event_ids(
        &self,
        txn: &impl TxnRead,
        room_id: &OwnedRoomId,
    ) -> Result<Vec<OwnedEventId>> {
        let (begin, end) = self.by_room_extrem.range_of(&[room_id.as_str().into()]);
        let kvs = txn.get_range(&begin, &end, RangeOptions::default())?;
        let mut out = Vec::with_capacity(kvs.len());
        for (key, _) in kvs {
            let elems = self.by_room_extrem.unpack(&key)?;
            if elems.len() != 2 {
                return Err(RoomservError::Fatal("malformed extremity key".into()));
            }
            let event_id = OwnedEventId::try_from(keys::element_str(&elems[1])?)
                .map_err(|err| RoomservError::Fatal(format!("malformed event id: {err}")))?;
            out.push(event_id);
        }
        Ok(out)
    }

    pub fn provider<'t, T: TxnRead>(&'t self, txn: &'t T) -> TxnEventsProvider<'t, T> {
        TxnEventsProvider {
            directory: self,
            txn,
            wanted: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

/// Restricts which state slots a state-at-event walk visits.
#[derive(Clone, Copy)]
pub enum StateFilter<'a> {
    All,
    /// Only the types consulted by event authorisation, plus members.
    AuthSet,
    /// Only membership slots for the given users.
    Members(&'a [OwnedUserId]),
}

/// Per-transaction batching helper. Callers declare intended reads with
/// `will_get` and the provider fetches them lazily in one pass; `must_get`
/// panics if a previously declared id was absent, which is a caller bug.
/// Scoped to its transaction by borrow; it cannot outlive it.
pub struct TxnEventsProvider<'t, T: TxnRead> {
    directory: &'t EventsDirectory,
    txn: &'t T,
    wanted: Mutex<HashSet<OwnedEventId>>,
    cache: Mutex<HashMap<OwnedEventId, Event>>,
}

impl<'t, T: TxnRead> TxnEventsProvider<'t, T> {
    pub fn will_get(&self, event_id: &OwnedEventId) {
        if !self.cache.lock().contains_key(event_id) {
            self.wanted.lock().insert(event_id.clone());
        }
    }

    /// Seed the cache with events already in hand.
    pub fn with_events(self, events: impl IntoIterator<Item = Event>) -> Self {
        {
            let mut cache = self.cache.lock();
            for ev in events {
                cache.insert(ev.id.clone(), ev);
            }
        }
        self
    }

    fn fetch_wanted(&self) -> Result<()> {
        let wanted: Vec<OwnedEventId> = self.wanted.lock().drain().collect();
        if wanted.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.lock();
        for event_id in wanted {
            if let Some(ev) = self.directory.txn_get_event(self.txn, &event_id)? {
                cache.insert(event_id, ev);
            }
        }
        Ok(())
    }

    pub fn get(&self, event_id: &OwnedEventId) -> Result<Event> {
        if let Some(ev) = self.cache.lock().get(event_id) {
            return Ok(ev.clone());
        }
        self.will_get(event_id);
        self.fetch_wanted()?;
        self.cache
            .lock()
            .get(event_id)
            .cloned()
            .ok_or(RoomservError::EventNotFound)
    }

    pub fn must_get(&self, event_id: &OwnedEventId) -> Event {
        match self.get(event_id) {
            Ok(ev) => ev,
            Err(err) => panic!("declared event {event_id} was absent: {err}"),
        }
    }
}

pub(crate) fn membership_value(event_id: &OwnedEventId, membership: Membership) -> Vec<u8> {
    keys::pack(&[
        event_id.as_str().into(),
        membership.as_str().into(),
    ])
}

pub(crate) fn parse_membership_value(raw: &[u8]) -> Result<(OwnedEventId, Membership)> {
    let elems = keys::unpack(raw)?;
    if elems.len() != 2 {
        return Err(RoomservError::Fatal("malformed membership value".into()));
    }
    let event_id = OwnedEventId::try_from(keys::element_str(&elems[0])?)
        .map_err(|err| RoomservError::Fatal(format!("malformed event id: {err}")))?;
    let membership = Membership::parse(keys::element_str(&elems[1])?)
        .ok_or_else(|| RoomservError::Fatal("unknown membership".into()))?;
    Ok((event_id, membership))
}

pub(crate) fn event_id_from_bytes(raw: &[u8]) -> Result<OwnedEventId> {
    let s = std::str::from_utf8(raw)
        .map_err(|err| RoomservError::Fatal(format!("malformed event id bytes: {err}")))?;
    OwnedEventId::try_from(s)
        .map_err(|err| RoomservError::Fatal(format!("malformed event id: {err}")))
}
