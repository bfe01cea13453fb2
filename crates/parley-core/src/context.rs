use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which side of the session this participant joined as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "guest" => Ok(Role::Guest),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Identity of one participant in one session. Fixed for the session's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub token: String,
    pub participant_id: String,
    pub role: Role,
}

impl SessionContext {
    pub fn new(token: impl Into<String>, participant_id: impl Into<String>, role: Role) -> Self {
        Self {
            token: token.into(),
            participant_id: participant_id.into(),
            role,
        }
    }
}
