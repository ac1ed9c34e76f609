use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    id20::{Id20, InvalidName},
    utils::serialize_id20,
};

/// A name this node is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalRecord {
    pub name: String,
    #[serde(serialize_with = "serialize_id20")]
    pub id: Id20,
    /// `None` lets receivers use the address the announce came from.
    pub addr: Option<IpAddr>,
}

impl LocalRecord {
    pub fn new(realm: Option<&str>, name: &str, addr: Option<IpAddr>) -> Result<Self, InvalidName> {
        Ok(Self {
            name: name.to_owned(),
            id: Id20::from_name(realm, name)?,
            addr,
        })
    }
}

/// Keeps track of when local records are due to be announced again.
pub struct Announcer {
    records: Vec<LocalRecord>,
    interval: Duration,
    next_due: Option<Instant>,
}

impl Announcer {
    pub fn new(records: Vec<LocalRecord>, interval: Duration) -> Self {
        Self {
            records,
            interval,
            next_due: None,
        }
    }

    pub fn records(&self) -> &[LocalRecord] {
        &self.records
    }

    /// Adds or replaces a record. It's announced on the next check.
    pub fn add(&mut self, record: LocalRecord) {
        self.records.retain(|r| r.id != record.id);
        self.records.push(record);
        self.next_due = None;
    }

    pub fn remove(&mut self, id: &Id20) -> bool {
        let before = self.records.len();
        self.records.retain(|r| &r.id != id);
        before != self.records.len()
    }

    /// Returns the records to announce now, if a cycle is due.
    pub fn due(&mut self, now: Instant) -> Vec<LocalRecord> {
        if self.records.is_empty() {
            return Vec::new();
        }
        match self.next_due {
            Some(next) if now < next => Vec::new(),
            _ => {
                self.next_due = Some(now + self.interval);
                self.records.clone()
            }
        }
    }
}
