use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "master")]
    Master,
    #[serde(rename = "superAdmin")]
    SuperAdmin,
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "child")]
    Child,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "master" => Some(Self::Master),
            "superAdmin" => Some(Self::SuperAdmin),
            "admin" => Some(Self::Admin),
            "child" => Some(Self::Child),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::SuperAdmin => "superAdmin",
            Self::Admin => "admin",
            Self::Child => "child",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Self::Master => 3,
            Self::SuperAdmin => 2,
            Self::Admin => 1,
            Self::Child => 0,
        }
    }

    pub fn is_staff(self) -> bool {
        self != Self::Child
    }

    pub fn at_least(self, other: Role) -> bool {
        self.rank() >= other.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

/// Strict `YYYY-MM-DD`.
pub fn parse_birth_day(s: &str) -> Option<NaiveDate> {
    let t = s.trim();
    let b = t.as_bytes();
    if b.len() != 10 || b[4] != b'-' || b[7] != b'-' {
        return None;
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d").ok()
}

/// Day-granular date; a trailing time part (`T...`) is ignored.
pub fn parse_day(s: &str) -> Option<NaiveDate> {
    let t = s.trim();
    let day = t.split_once('T').map(|(d, _)| d).unwrap_or(t);
    parse_birth_day(day)
}

pub fn format_day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}
