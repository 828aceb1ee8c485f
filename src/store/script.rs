//! Store scripts and their planning.
//!
//! Every operation is planned as a pure function of the cells it reads,
//! producing the writes to apply and the reply to return. Backends decide
//! how to make read + write indivisible.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::{Cell, Counter, StoreError, StoredValue};
use super::cas::CasWrite;

/// Multi-step operations executed in one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Set `lock_key` if absent and bump `fence_key`, both or neither.
    AcquireFenced {
        lock_key: String,
        fence_key: String,
        value: String,
        ttl: Duration,
    },
    /// Reset the expiry of `key` only if it still holds `value`.
    ExtendIfEquals { key: String, value: String, ttl: Duration },
    /// Drop expired members, count, and add `member` when below `max`.
    SlidingWindow {
        key: String,
        window: Duration,
        max: u32,
        member: String,
    },
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Script::AcquireFenced { .. } => "acquire_fenced",
            Script::ExtendIfEquals { .. } => "extend_if_equals",
            Script::SlidingWindow { .. } => "sliding_window",
        }
    }

    /// Keys the script reads or writes.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Script::AcquireFenced { lock_key, fence_key, .. } => vec![lock_key.as_str(), fence_key.as_str()],
            Script::ExtendIfEquals { key, .. } | Script::SlidingWindow { key, .. } => vec![key.as_str()],
        }
    }
}

/// Reply of a [`Script`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    /// Fencing token when the lock was taken, `None` on contention.
    Fenced(Option<u64>),
    Flag(bool),
    Window(WindowReply),
}

impl ScriptReply {
    pub fn into_fenced(self) -> Result<Option<u64>, StoreError> {
        match self {
            ScriptReply::Fenced(token) => Ok(token),
            _ => Err(StoreError::UnexpectedReply { script: "acquire_fenced" }),
        }
    }

    pub fn into_flag(self) -> Result<bool, StoreError> {
        match self {
            ScriptReply::Flag(flag) => Ok(flag),
            _ => Err(StoreError::UnexpectedReply { script: "extend_if_equals" }),
        }
    }

    pub fn into_window(self) -> Result<WindowReply, StoreError> {
        match self {
            ScriptReply::Window(reply) => Ok(reply),
            _ => Err(StoreError::UnexpectedReply { script: "sliding_window" }),
        }
    }
}

/// Outcome of a sliding window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReply {
    pub allowed: bool,
    /// Members in the window after the check.
    pub count: u32,
    /// Age of the oldest member still in the window.
    pub oldest_age: Option<Duration>,
}

/// Writes to apply plus the reply to hand back once they are applied.
#[derive(Debug)]
pub struct Plan<R> {
    pub writes: Vec<CasWrite>,
    pub reply: R,
}

impl<R> Plan<R> {
    fn read_only(reply: R) -> Self {
        Self { writes: Vec::new(), reply }
    }
}

/// Read access to the cells involved in an operation.
pub type Reader<'a> = &'a (dyn Fn(&str) -> Option<Cell> + Send + Sync);

pub fn plan_set_if_absent(read: Reader<'_>, key: &str, value: &str, ttl: Duration) -> Plan<bool> {
    if read(key).is_some() {
        return Plan::read_only(false);
    }
    Plan {
        writes: vec![CasWrite::put(key, StoredValue::Text(value.to_string()), Some(ttl))],
        reply: true,
    }
}

pub fn plan_delete_if_equals(read: Reader<'_>, key: &str, value: &str) -> Plan<bool> {
    match read(key) {
        Some(Cell { value: StoredValue::Text(current), .. }) if current == value => Plan {
            writes: vec![CasWrite::Delete { key: key.to_string() }],
            reply: true,
        },
        _ => Plan::read_only(false),
    }
}

pub fn plan_incr_with_expiry(
    read: Reader<'_>,
    key: &str,
    ttl: Duration,
) -> Result<Plan<Counter>, StoreError> {
    let (value, expires_in) = match read(key) {
        None => (1, Some(ttl)),
        Some(Cell { value: StoredValue::Counter(n), expires_in }) => (n.saturating_add(1), expires_in),
        Some(Cell { value: other, .. }) => {
            return Err(StoreError::WrongType { key: key.to_string(), found: other.type_name() })
        }
    };
    Ok(Plan {
        writes: vec![CasWrite::put(key, StoredValue::Counter(value), expires_in)],
        reply: Counter { value, expires_in },
    })
}

/// Plan any script against the current cells.
pub fn plan_script(read: Reader<'_>, script: &Script, now: Instant) -> Result<Plan<ScriptReply>, StoreError> {
    match script {
        Script::AcquireFenced { lock_key, fence_key, value, ttl } => {
            if read(lock_key).is_some() {
                return Ok(Plan::read_only(ScriptReply::Fenced(None)));
            }
            let token = match read(fence_key) {
                None => 1,
                Some(Cell { value: StoredValue::Counter(n), .. }) => n.saturating_add(1),
                Some(Cell { value: other, .. }) => {
                    return Err(StoreError::WrongType {
                        key: fence_key.clone(),
                        found: other.type_name(),
                    })
                }
            };
            Ok(Plan {
                writes: vec![
                    CasWrite::put(lock_key, StoredValue::Text(value.clone()), Some(*ttl)),
                    // Fence counters never expire; expiry would restart them at 1.
                    CasWrite::put(fence_key, StoredValue::Counter(token), None),
                ],
                reply: ScriptReply::Fenced(Some(token)),
            })
        }
        Script::ExtendIfEquals { key, value, ttl } => match read(key) {
            Some(Cell { value: StoredValue::Text(current), .. }) if current == *value => Ok(Plan {
                writes: vec![CasWrite::put(key, StoredValue::Text(current), Some(*ttl))],
                reply: ScriptReply::Flag(true),
            }),
            _ => Ok(Plan::read_only(ScriptReply::Flag(false))),
        },
        Script::SlidingWindow { key, window, max, member } => {
            let mut members = match read(key) {
                None => VecDeque::new(),
                Some(Cell { value: StoredValue::Window(members), .. }) => members,
                Some(Cell { value: other, .. }) => {
                    return Err(StoreError::WrongType { key: key.clone(), found: other.type_name() })
                }
            };
            while members
                .front()
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= *window)
            {
                members.pop_front();
            }

            let allowed = members.len() < *max as usize;
            if allowed {
                members.push_back((now, member.clone()));
            }
            let reply = WindowReply {
                allowed,
                count: u32::try_from(members.len()).unwrap_or(u32::MAX),
                oldest_age: members.front().map(|(at, _)| now.saturating_duration_since(*at)),
            };
            Ok(Plan {
                writes: vec![CasWrite::put(key, StoredValue::Window(members), Some(*window))],
                reply: ScriptReply::Window(reply),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn reader(cells: HashMap<String, Cell>) -> impl Fn(&str) -> Option<Cell> + Send + Sync {
        move |key: &str| cells.get(key).cloned()
    }

    #[test]
    fn test_acquire_fenced_contention_is_read_only() {
        let mut cells = HashMap::new();
        cells.insert(
            "lock:a".to_string(),
            Cell { value: StoredValue::Text("other".into()), expires_in: None },
        );
        let read = reader(cells);
        let script = Script::AcquireFenced {
            lock_key: "lock:a".into(),
            fence_key: "fence:a".into(),
            value: "mine".into(),
            ttl: Duration::from_secs(1),
        };
        let plan = plan_script(&read, &script, Instant::now()).unwrap();
        assert!(plan.writes.is_empty());
        assert_eq!(plan.reply, ScriptReply::Fenced(None));
    }

    #[test]
    fn test_acquire_fenced_bumps_existing_fence() {
        let mut cells = HashMap::new();
        cells.insert(
            "fence:a".to_string(),
            Cell { value: StoredValue::Counter(41), expires_in: None },
        );
        let read = reader(cells);
        let script = Script::AcquireFenced {
            lock_key: "lock:a".into(),
            fence_key: "fence:a".into(),
            value: "mine".into(),
            ttl: Duration::from_secs(1),
        };
        let plan = plan_script(&read, &script, Instant::now()).unwrap();
        assert_eq!(plan.reply, ScriptReply::Fenced(Some(42)));
        assert_eq!(plan.writes.len(), 2);
    }

    #[test]
    fn test_incr_rejects_text() {
        let mut cells = HashMap::new();
        cells.insert("k".to_string(), Cell { value: StoredValue::Text("x".into()), expires_in: None });
        let read = reader(cells);
        let err = plan_incr_with_expiry(&read, "k", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, StoreError::WrongType { found: "text", .. }));
    }

    #[test]
    fn test_sliding_window_denies_at_max() {
        let now = Instant::now();
        let mut members = VecDeque::new();
        members.push_back((now, "a".to_string()));
        members.push_back((now, "b".to_string()));
        let mut cells = HashMap::new();
        cells.insert("w".to_string(), Cell { value: StoredValue::Window(members), expires_in: None });
        let read = reader(cells);
        let script = Script::SlidingWindow {
            key: "w".into(),
            window: Duration::from_secs(60),
            max: 2,
            member: "c".into(),
        };
        let reply = plan_script(&read, &script, now).unwrap().reply.into_window().unwrap();
        assert!(!reply.allowed);
        assert_eq!(reply.count, 2);
    }
}
