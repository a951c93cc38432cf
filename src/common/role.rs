//! The two roles an endpoint can have in a room.
//!
//! Exactly one endpoint per room is the master.  It is assigned from config at
//! session start, there is no election.
use serde::{Deserialize, Serialize};
use simple_error::SimpleError;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Follower,
}

impl Role {
    pub fn is_master(&self) -> bool {
        *self == Role::Master
    }
}

impl FromStr for Role {
    type Err = SimpleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "follower" => Ok(Role::Follower),
            other => Err(SimpleError::new(format!("unknown role: {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

#[cfg(test)]
mod test_role {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!("master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!(" Follower ".parse::<Role>().unwrap(), Role::Follower);
        assert!("conductor".parse::<Role>().is_err());
    }
    #[test]
    fn serde_names() {
        let v = serde_json::to_value(Role::Master).unwrap();
        assert_eq!(v, "master");
        assert!(Role::Master.is_master());
        assert!(!Role::Follower.is_master());
    }
}
