use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::{
    connection::ConnectionHandle,
    error::{Result, RoomError},
};

struct Entry {
    handle: Arc<dyn ConnectionHandle>,
    rooms: HashSet<String>,
}

/// Both membership views live behind one lock so every operation updates
/// them together.
#[derive(Default)]
struct Inner {
    connections: HashMap<String, Entry>,
    /// room -> member ids. A room with no members has no entry.
    rooms: HashMap<String, HashSet<String>>,
}

/// Live connections and their room memberships.
///
/// Subscribe and unsubscribe are idempotent. Removing a connection drops it
/// from every room in the same critical section, so `members_of` never
/// returns a disconnected id.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the two views out of step
    // (every mutation is a few infallible map operations), so poisoned
    // guards are safe to reuse.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new connection. Returns `false` (and keeps the existing entry)
    /// if the id is already registered.
    pub fn register(&self, handle: Arc<dyn ConnectionHandle>) -> bool {
        let id = handle.id().to_string();
        let mut inner = self.write();
        if inner.connections.contains_key(&id) {
            return false;
        }
        inner.connections.insert(
            id.clone(),
            Entry {
                handle,
                rooms: HashSet::new(),
            },
        );
        debug!(conn_id = %id, total = inner.connections.len(), "connection registered");
        true
    }

    /// Forget a connection and every membership it held.
    ///
    /// Returns the rooms it was in, or `None` if it was not registered.
    pub fn remove(&self, id: &str) -> Option<Vec<String>> {
        let mut inner = self.write();
        let entry = inner.connections.remove(id)?;
        for room in &entry.rooms {
            detach(&mut inner.rooms, room, id);
        }
        info!(conn_id = %id, rooms = entry.rooms.len(), "connection removed");
        Some(entry.rooms.into_iter().collect())
    }

    /// Join rooms. Returns the rooms that were newly joined; rooms the
    /// connection already belongs to are skipped silently.
    pub fn subscribe<I, S>(&self, id: &str, rooms: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms = validate(rooms)?;
        let mut inner = self.write();
        let Inner {
            connections,
            rooms: index,
        } = &mut *inner;
        let entry = connections
            .get_mut(id)
            .ok_or_else(|| RoomError::ConnectionNotFound { id: id.to_string() })?;

        let mut joined = Vec::new();
        for room in rooms {
            if entry.rooms.insert(room.clone()) {
                index.entry(room.clone()).or_default().insert(id.to_string());
                joined.push(room);
            }
        }
        if !joined.is_empty() {
            debug!(conn_id = %id, rooms = ?joined, "subscribed");
        }
        Ok(joined)
    }

    /// Leave rooms. Returns the rooms that were actually left.
    pub fn unsubscribe<I, S>(&self, id: &str, rooms: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms = validate(rooms)?;
        let mut inner = self.write();
        let Inner {
            connections,
            rooms: index,
        } = &mut *inner;
        let entry = connections
            .get_mut(id)
            .ok_or_else(|| RoomError::ConnectionNotFound { id: id.to_string() })?;

        let mut left = Vec::new();
        for room in rooms {
            if entry.rooms.remove(&room) {
                detach(index, &room, id);
                left.push(room);
            }
        }
        if !left.is_empty() {
            debug!(conn_id = %id, rooms = ?left, "unsubscribed");
        }
        Ok(left)
    }

    /// Ids currently subscribed to `room`. Empty if the room does not exist.
    pub fn members_of(&self, room: &str) -> HashSet<String> {
        self.read().rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ConnectionHandle>> {
        self.read()
            .connections
            .get(id)
            .map(|e| Arc::clone(&e.handle))
            .ok_or_else(|| RoomError::ConnectionNotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().connections.contains_key(id)
    }

    /// Rooms a connection belongs to, sorted.
    pub fn rooms_of(&self, id: &str) -> Result<Vec<String>> {
        let inner = self.read();
        let entry = inner
            .connections
            .get(id)
            .ok_or_else(|| RoomError::ConnectionNotFound { id: id.to_string() })?;
        let mut rooms: Vec<String> = entry.rooms.iter().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }

    /// Every live connection handle.
    pub fn connections(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        self.read()
            .connections
            .values()
            .map(|e| Arc::clone(&e.handle))
            .collect()
    }

    /// Names of all non-empty rooms, sorted.
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handles for every member of any of `rooms`, each connection once.
    pub fn handles_in<'a>(
        &self,
        rooms: impl IntoIterator<Item = &'a str>,
    ) -> Vec<Arc<dyn ConnectionHandle>> {
        let inner = self.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for room in rooms {
            let Some(members) = inner.rooms.get(room) else {
                continue;
            };
            for id in members {
                if seen.insert(id.as_str()) {
                    if let Some(entry) = inner.connections.get(id) {
                        out.push(Arc::clone(&entry.handle));
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn room_count(&self) -> usize {
        self.read().rooms.len()
    }
}

fn detach(index: &mut HashMap<String, HashSet<String>>, room: &str, id: &str) {
    if let Some(members) = index.get_mut(room) {
        members.remove(id);
        if members.is_empty() {
            index.remove(room);
        }
    }
}

fn validate<I, S>(rooms: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    rooms
        .into_iter()
        .map(Into::into)
        .map(|room| {
            if room.trim().is_empty() {
                Err(RoomError::InvalidRoom(room))
            } else {
                Ok(room)
            }
        })
        .collect()
}
