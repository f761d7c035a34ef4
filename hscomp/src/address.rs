//! Thread and component addresses

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a dispatcher thread: process id, thread id and name.
///
/// The name is unique within a process; the thread id is assigned when the
/// thread is created and is `0` before that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadAddress {
    process_id: u32,
    thread_id: u32,
    name: String,
}

impl ThreadAddress {
    pub fn new(thread_id: u32, name: impl Into<String>) -> Self {
        Self {
            process_id: std::process::id(),
            thread_id,
            name: name.into(),
        }
    }

    /// Address of a thread that has not been created yet.
    pub fn unassigned(name: impl Into<String>) -> Self {
        Self::new(0, name)
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid(&self) -> bool {
        self.thread_id != 0 && !self.name.is_empty()
    }

    pub fn is_local(&self) -> bool {
        self.process_id == std::process::id()
    }
}

impl fmt::Display for ThreadAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}.{}", self.name, self.process_id, self.thread_id)
    }
}

/// Identity of a component: hosting thread plus role name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentAddress {
    thread: ThreadAddress,
    role_name: String,
}

impl ComponentAddress {
    pub fn new(thread: ThreadAddress, role_name: impl Into<String>) -> Self {
        Self {
            thread,
            role_name: role_name.into(),
        }
    }

    pub fn thread(&self) -> &ThreadAddress {
        &self.thread
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn is_valid(&self) -> bool {
        self.thread.is_valid() && !self.role_name.is_empty()
    }
}

impl fmt::Display for ComponentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.thread, self.role_name)
    }
}
