//! Session persistence for the worker.
//!
//! One JSON file maps incident ids to agent session state so follow-up
//! messages can resume the right session after a worker restart. Every
//! mutation is persisted with a write-then-rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub incident_id: String,
    #[serde(default)]
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub full_log: String,
}

pub struct SessionStore {
    path: PathBuf,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Loads the store; a missing file starts empty, a corrupt one is
    /// discarded with a warning rather than blocking startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sessions = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding unreadable session file");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            sessions: Mutex::new(sessions),
        }
    }

    pub fn get(&self, incident_id: &str) -> Option<Session> {
        self.lock_sessions().get(incident_id).cloned()
    }

    pub fn create(&self, incident_id: &str) {
        let now = Utc::now();
        let session = Session {
            incident_id: incident_id.to_string(),
            session_id: String::new(),
            status: SessionStatus::Pending,
            started_at: now,
            updated_at: now,
            response: String::new(),
            full_log: String::new(),
        };
        let mut sessions = self.lock_sessions();
        sessions.insert(incident_id.to_string(), session);
        self.persist(&sessions);
    }

    pub fn set_running(&self, incident_id: &str, session_id: &str) {
        self.update(incident_id, |session| {
            session.session_id = session_id.to_string();
            session.status = SessionStatus::Running;
        });
    }

    pub fn set_completed(&self, incident_id: &str, response: &str, full_log: &str) {
        self.update(incident_id, |session| {
            session.status = SessionStatus::Completed;
            session.response = response.to_string();
            session.full_log = full_log.to_string();
        });
    }

    pub fn set_failed(&self, incident_id: &str, error: &str) {
        self.update(incident_id, |session| {
            session.status = SessionStatus::Failed;
            session.response = error.to_string();
        });
    }

    fn update(&self, incident_id: &str, apply: impl FnOnce(&mut Session)) {
        let mut sessions = self.lock_sessions();
        if let Some(session) = sessions.get_mut(incident_id) {
            apply(session);
            session.updated_at = Utc::now();
            self.persist(&sessions);
        }
    }

    fn persist(&self, sessions: &HashMap<String, Session>) {
        let data = match serde_json::to_string_pretty(sessions) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "failed to encode session file");
                return;
            }
        };
        let tmp = tmp_path(&self.path);
        if let Err(err) = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!(path = %self.path.display(), error = %err, "failed to persist sessions");
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
